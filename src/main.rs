//! Mobile-Env 冒烟运行器
//!
//! 加载配置与任务，连接远程 daemon，跑若干回合的抬手动作并输出计数器。
//!
//! 运行方式：
//! ```bash
//! cargo run -- tasks/demo.toml
//! MENV_EPISODES=5 MENV_EPISODE_STEPS=50 cargo run -- tasks/demo.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;

use mobile_env::config::load_config;
use mobile_env::core::shutdown::run_with_graceful_shutdown;
use mobile_env::core::{
    create_orchestrator, Orchestrator, OrchestratorCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use mobile_env::device::Action;
use mobile_env::observability;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn run_episodes(
    orchestrator: Arc<Mutex<Orchestrator>>,
    shutdown: Arc<ShutdownManager>,
    episodes: usize,
    steps_per_episode: usize,
) {
    let mut env = orchestrator.lock().await;
    if let Err(e) = env.start().await {
        tracing::error!(error = %e, "failed to start environment");
        shutdown.shutdown(ShutdownReason::Fatal(e.to_string()));
        return;
    }

    for episode in 0..episodes {
        if let Err(e) = env.reset_environment_state().await {
            tracing::error!(episode, error = %e, "reset failed");
            shutdown.shutdown(ShutdownReason::Fatal(e.to_string()));
            return;
        }

        let started_at = chrono::Utc::now().timestamp_millis();
        let mut total_reward = 0.0;
        let mut steps = 0;
        while steps < steps_per_episode {
            steps += 1;
            match env.execute_action(Some(vec![Action::lift()])).await {
                Ok(outcome) => {
                    total_reward += outcome.reward;
                    for instruction in &outcome.instructions {
                        tracing::info!(episode, step = steps, %instruction, "instruction");
                    }
                    if outcome.episode_end {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(episode, error = %e, "step failed");
                    shutdown.shutdown(ShutdownReason::Fatal(e.to_string()));
                    return;
                }
            }
        }

        tracing::info!(
            episode,
            steps,
            total_reward,
            started_at,
            duration_ms = chrono::Utc::now().timestamp_millis() - started_at,
            "episode finished"
        );
    }

    let counters = serde_json::to_string(&env.logs()).unwrap_or_default();
    tracing::info!(%counters, "run finished");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let task_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = std::env::var("MENV_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let episodes = env_usize("MENV_EPISODES", 3);
    let steps_per_episode = env_usize("MENV_EPISODE_STEPS", 20);
    let run_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(%run_id, episodes, steps_per_episode, "starting mobile-env runner");

    let shutdown = Arc::new(ShutdownManager::new());
    let orchestrator = create_orchestrator(&cfg, task_path, shutdown.token())
        .context("Failed to create orchestrator")?;
    let orchestrator = Arc::new(Mutex::new(orchestrator));

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone())
        .with_step_timeout(Duration::from_secs_f64(cfg.remote.launch_timeout_secs.max(1.0)));
    coordinator.register(OrchestratorCleanup::new(orchestrator.clone()));

    run_with_graceful_shutdown(
        coordinator,
        run_episodes(orchestrator, shutdown.clone(), episodes, steps_per_episode),
    )
    .await;

    if let Some(ShutdownReason::Fatal(message)) = shutdown.reason() {
        anyhow::bail!("run aborted: {message}");
    }

    tracing::info!(%run_id, "runner exited");
    Ok(())
}
