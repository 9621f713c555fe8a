use anyhow::{Context, Result};
use sitebot_core::PortAllocator;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, Level};

use sitebot_server::builder::{prepare_root, ProcessSiteBuilder};
use sitebot_server::commands::CommandProcessor;
use sitebot_server::comments::{default_templates, CommentComposer};
use sitebot_server::config::Config;
use sitebot_server::dispatch::{DelayedScheduler, EventRouter};
use sitebot_server::handlers::{IssueCommentHandler, PullRequestHandler};
use sitebot_server::instances::{InstanceManager, InstanceRegistry};
use sitebot_server::reaper::reaper_loop;
use sitebot_server::{app, AppState, GitHubClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting preview site bot");

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    let github = Arc::new(GitHubClient::new(config.github_token.clone())?);

    // Everything that can fail is resolved before the listener opens
    let bot_login = github
        .authenticated_login()
        .await
        .context("Failed to resolve the bot's GitHub login")?;
    info!("Authenticated as {}", bot_login);

    let templates = default_templates().context("Failed to register comment templates")?;
    prepare_root(&config.site_root).await?;
    let ports = PortAllocator::new(config.min_port, config.max_port, config.max_consecutive)
        .context("Invalid port range")?;

    let scheduler = DelayedScheduler::new();
    let builder = ProcessSiteBuilder::new(
        config.site_root.clone(),
        config.start_command.clone(),
        config.internal_ip_override.clone(),
        github.clone(),
    );
    let composer = Arc::new(CommentComposer::new(
        templates,
        github.clone(),
        bot_login,
        config.link_domain.clone(),
    ));
    let manager = Arc::new(InstanceManager::new(
        InstanceRegistry::new(ports, config.block_size()),
        Arc::new(builder),
        composer,
        Arc::clone(&scheduler),
    ));
    let commands = Arc::new(CommandProcessor::new(Arc::clone(&manager)));

    let mut router = EventRouter::new(Arc::clone(&scheduler));
    router
        .add_listener(
            "issue_comment",
            Arc::new(IssueCommentHandler::new(commands)),
            Duration::ZERO,
        )
        .add_listener(
            "pull_request",
            Arc::new(PullRequestHandler::new(Arc::clone(&manager))),
            config.pull_request_delay,
        );

    if let Some(threshold) = config.idle_threshold() {
        info!(
            "Reaping instances idle for more than {} hour(s)",
            config.instance_open_hours
        );
        let reaper_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            reaper_loop(reaper_manager, threshold).await;
        });
    }

    let app_state = Arc::new(AppState {
        webhook_secret: config.github_webhook_secret,
        router: Arc::new(router),
        manager,
        scheduler,
        status_auth_token: config.status_auth_token,
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.webhook_port)).await?;
    info!("Server listening on port {}", config.webhook_port);

    axum::serve(listener, app(app_state)).await?;

    Ok(())
}
