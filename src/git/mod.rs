mod diff;
mod repo;

pub use diff::{DiffFile, DiffHunkIndex, DiffParseError, FileStatus};
pub use repo::{
    get_origin_url, get_rel_workdir, get_repo_root, parse_owner_repo_from_remote,
    run_diff_command, DiffSource,
};
