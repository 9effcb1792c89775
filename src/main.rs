use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use diffnote::backend::bitbucket::ReportSettings;
use diffnote::backend::{
    BitbucketCodeInsights, BitbucketServerInsights, GitHubCheck, GitHubPrReview,
    GitLabMrDiscussion, ReviewTarget, ServerAuth,
};
use diffnote::comment::{
    BufferedCommentService, CommentService, FileLevelPolicy, MultiCommentService,
};
use diffnote::config::{load_config, DiffnoteConfig};
use diffnote::diagnostic::{parse_diagnostics, InputFormat};
use diffnote::filter::{DiagnosticFilter, FilterMode};
use diffnote::git::{self, DiffHunkIndex};
use diffnote::local::LocalCommentWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Reporter {
    /// Print findings to stdout
    Local,
    GithubPrReview,
    /// Annotations on a GitHub check run (needs a GitHub App token)
    GithubCheck,
    GitlabMrDiscussion,
    BitbucketCodeInsights,
    /// Code insights on Bitbucket Server / Data Center
    BitbucketServerInsights,
}

/// Post linter diagnostics that touch a change as review comments.
/// Diagnostics are read from stdin.
#[derive(Parser)]
#[command(name = "diffnote", version, about)]
struct Cli {
    /// Where to report; repeat for several
    #[arg(short, long = "reporter", value_enum, default_value = "local")]
    reporters: Vec<Reporter>,

    /// Tool name used when the input doesn't carry one
    #[arg(long)]
    name: Option<String>,

    /// Input format (rdjsonl, line)
    #[arg(short, long)]
    format: Option<InputFormat>,

    /// Which findings count as part of the change (added, diff_context, file, nofilter)
    #[arg(long)]
    filter_mode: Option<FilterMode>,

    /// What to do with whole-file findings (discard, comment)
    #[arg(long)]
    file_level: Option<FileLevelPolicy>,

    /// Shell command printing the unified diff to compare against
    #[arg(long)]
    diff: Option<String>,

    /// Leading path components to strip from diff file names
    #[arg(long)]
    strip: Option<usize>,

    /// Config file to use instead of the repository's .diffnote.toml
    #[arg(long)]
    conf: Option<PathBuf>,

    /// Repository owner, group or workspace (defaults to the origin remote)
    #[arg(long, env = "DIFFNOTE_OWNER")]
    owner: Option<String>,

    /// Repository name (defaults to the origin remote)
    #[arg(long, env = "DIFFNOTE_REPO")]
    repo: Option<String>,

    /// Pull/merge request number
    #[arg(long, env = "DIFFNOTE_PR")]
    pr: Option<u64>,

    /// Head commit SHA
    #[arg(long, env = "DIFFNOTE_SHA")]
    sha: Option<String>,

    #[arg(long, env = "GITLAB_API_TOKEN", hide_env_values = true)]
    gitlab_token: Option<String>,

    #[arg(long, env = "BITBUCKET_ACCESS_TOKEN", hide_env_values = true)]
    bitbucket_token: Option<String>,

    /// Bitbucket Server base URL (overrides [bitbucket] server_url)
    #[arg(long, env = "BITBUCKET_SERVER_URL")]
    bitbucket_server_url: Option<String>,

    #[arg(long, env = "BITBUCKET_USER")]
    bitbucket_user: Option<String>,

    #[arg(long, env = "BITBUCKET_PASSWORD", hide_env_values = true)]
    bitbucket_password: Option<String>,

    /// Give up posting after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Exit 1 when any finding lands in the change
    #[arg(long)]
    fail_on_error: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:?}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(mut cli: Cli) -> Result<ExitCode> {
    let repo_root = git::get_repo_root().ok();
    let workdir = git::get_rel_workdir().unwrap_or_default();
    let config = load_config(repo_root.as_deref(), cli.conf.as_deref())?;

    let mut seen = Vec::new();
    cli.reporters.retain(|r| {
        let first = !seen.contains(r);
        seen.push(*r);
        first
    });
    let remote = cli.reporters.iter().any(|r| *r != Reporter::Local);
    let target = if remote { Some(resolve_target(&cli)?) } else { None };

    let input = tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin()))
        .await?
        .context("Failed to read diagnostics from stdin")?;
    let name = cli.name.clone().or_else(|| config.report.name.clone());
    let format = cli.format.unwrap_or(config.report.format);
    let diagnostics = parse_diagnostics(&input, format, name.as_deref());
    tracing::debug!(count = diagnostics.len(), %format, "parsed diagnostics");

    let command = diff_command(&cli, &config, target.as_ref());
    let strip = cli.strip.unwrap_or(config.diff.strip);
    let diff = tokio::task::spawn_blocking(move || git::run_diff_command(&command, strip, None))
        .await??;
    let index = DiffHunkIndex::build(&diff.text, diff.strip).context("Failed to parse diff")?;

    let mut filter = DiagnosticFilter::new(cli.filter_mode.unwrap_or(config.report.filter_mode));
    if let Some(root) = &repo_root {
        filter = filter.with_repo_root(root.clone());
    }
    let results = filter.filter(diagnostics, &index, &workdir);
    let in_diff = results.iter().filter(|r| r.in_diff).count();

    let file_level = cli.file_level.unwrap_or(config.report.file_level);
    let service = build_services(&cli, &config, target, repo_root, file_level)?;

    let cancel = CancellationToken::new();
    spawn_cancellers(&cancel, cli.timeout.map(Duration::from_secs));

    for result in results {
        if let Err(err) = service.post(result, &cancel).await {
            if cancel.is_cancelled() {
                eprintln!("Error: {:#}", err);
                return Ok(ExitCode::from(EXIT_CANCELLED));
            }
            return Err(err);
        }
    }

    match service.flush(&cancel).await {
        Ok(report) => {
            if remote {
                tracing::info!(
                    posted = report.posted,
                    eligible = report.eligible,
                    already_posted = report.already_posted,
                    "flush complete"
                );
            }
        }
        Err(err) if err.is_cancelled() => {
            eprintln!("Error: {}", err);
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            return Ok(ExitCode::FAILURE);
        }
    }

    let fail_on_error = cli.fail_on_error || config.report.fail_on_error;
    if fail_on_error && in_diff > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Review target from flags, falling back to the origin remote for owner/repo.
fn resolve_target(cli: &Cli) -> Result<ReviewTarget> {
    let pr = cli
        .pr
        .context("--pr (or DIFFNOTE_PR) is required for review reporters")?;
    let (owner, repo) = match (&cli.owner, &cli.repo) {
        (Some(owner), Some(repo)) => (owner.clone(), repo.clone()),
        (owner, repo) => {
            let remote = git::get_origin_url()
                .context("--owner/--repo not given and no origin remote to infer them from")?;
            let (o, r) = git::parse_owner_repo_from_remote(&remote)?;
            (owner.clone().unwrap_or(o), repo.clone().unwrap_or(r))
        }
    };
    Ok(ReviewTarget {
        owner,
        repo,
        pr,
        sha: cli.sha.clone(),
    })
}

fn diff_command(cli: &Cli, config: &DiffnoteConfig, target: Option<&ReviewTarget>) -> String {
    if let Some(cmd) = cli.diff.clone().or_else(|| config.diff.command.clone()) {
        return cmd;
    }
    let on_github = cli
        .reporters
        .iter()
        .any(|r| matches!(r, Reporter::GithubPrReview | Reporter::GithubCheck));
    match target {
        Some(t) if on_github => GitHubPrReview::diff_command(t),
        _ => "git diff".to_string(),
    }
}

fn build_services(
    cli: &Cli,
    config: &DiffnoteConfig,
    target: Option<ReviewTarget>,
    repo_root: Option<String>,
    file_level: FileLevelPolicy,
) -> Result<MultiCommentService> {
    let timeout = Duration::from_secs(cli.timeout.unwrap_or(60).max(1));
    let mut multi = MultiCommentService::default();

    let target_for = || target.clone().context("review target missing");

    for reporter in &cli.reporters {
        let service: Box<dyn CommentService> = match reporter {
            Reporter::Local => Box::new(LocalCommentWriter::stdout()),
            Reporter::GithubPrReview => {
                let backend = GitHubPrReview::new(target_for()?, repo_root.clone());
                Box::new(BufferedCommentService::new(backend).with_file_level(file_level))
            }
            Reporter::GithubCheck => {
                let backend =
                    GitHubCheck::new(target_for()?, &config.github.check_name, repo_root.clone());
                Box::new(BufferedCommentService::new(backend).with_file_level(file_level))
            }
            Reporter::GitlabMrDiscussion => {
                let token = cli
                    .gitlab_token
                    .clone()
                    .context("--gitlab-token (or GITLAB_API_TOKEN) is required")?;
                let backend =
                    GitLabMrDiscussion::new(&config.gitlab.api_url, token, target_for()?, timeout)?;
                Box::new(BufferedCommentService::new(backend).with_file_level(file_level))
            }
            Reporter::BitbucketCodeInsights => {
                let backend = BitbucketCodeInsights::new(
                    &config.bitbucket.api_url,
                    cli.bitbucket_token.clone(),
                    target_for()?,
                    report_settings(config),
                    timeout,
                )?;
                Box::new(BufferedCommentService::new(backend).with_file_level(file_level))
            }
            Reporter::BitbucketServerInsights => {
                let url = cli
                    .bitbucket_server_url
                    .clone()
                    .or_else(|| config.bitbucket.server_url.clone())
                    .context("--bitbucket-server-url (or [bitbucket] server_url) is required")?;
                let auth = ServerAuth::from_parts(
                    cli.bitbucket_token.clone(),
                    cli.bitbucket_user.clone(),
                    cli.bitbucket_password.clone(),
                );
                let backend = BitbucketServerInsights::new(
                    &url,
                    auth,
                    target_for()?,
                    report_settings(config),
                    timeout,
                )?;
                Box::new(BufferedCommentService::new(backend).with_file_level(file_level))
            }
        };
        multi.push(service);
    }
    Ok(multi)
}

fn report_settings(config: &DiffnoteConfig) -> ReportSettings {
    ReportSettings {
        id: config.bitbucket.report_id.clone(),
        title: config.bitbucket.report_title.clone(),
        reporter: "diffnote".to_string(),
        logo_url: config.bitbucket.logo_url.clone(),
    }
}

/// Ctrl-C and the optional deadline both cancel posting and flushing.
fn spawn_cancellers(cancel: &CancellationToken, timeout: Option<Duration>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    if let Some(timeout) = timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!(seconds = timeout.as_secs(), "timed out, cancelling");
            on_timeout.cancel();
        });
    }
}
