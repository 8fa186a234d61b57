//! Orchestrator construction and interruptible execution

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::cmd::shell::ShellRunner;
use crate::cmd::CommandRunner;
use crate::deploy::cancel::CancelToken;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::ManagerError;
use crate::progress::{ConsoleSink, Progress, ProgressSink, TracingSink};
use crate::storage::settings::Settings;

/// Load settings from the state directory of `options.paths`
pub async fn load_settings(options: &mut AppOptions) -> Result<(), ManagerError> {
    options.settings = Settings::load(&options.paths.settings_file()).await?;
    Ok(())
}

/// Orchestrator running real commands on the host
pub fn build_orchestrator(options: &AppOptions) -> Orchestrator {
    let runner: Arc<dyn CommandRunner> =
        Arc::new(ShellRunner::new(options.settings.use_sudo, options.verbose));
    build_orchestrator_with(options, runner)
}

/// Orchestrator over a caller-supplied command runner
pub fn build_orchestrator_with(options: &AppOptions, runner: Arc<dyn CommandRunner>) -> Orchestrator {
    let sink: Arc<dyn ProgressSink> = if options.console_progress {
        Arc::new(ConsoleSink)
    } else {
        Arc::new(TracingSink)
    };
    info!(
        "Managing apps in {} (state in {})",
        options.paths.apps_dir.display(),
        options.paths.state_dir.display()
    );
    Orchestrator::new(options.paths.clone(), options.settings.clone(), runner, Progress::new(sink))
}

/// Drive `work` to completion, cancelling it when `shutdown_signal` fires.
///
/// Cancellation is cooperative: `work` keeps running until its current step
/// ends and its rollback has finished.
pub async fn run_cancellable<T>(
    work: impl Future<Output = T>,
    cancel: CancelToken,
    shutdown_signal: impl Future<Output = ()>,
) -> T {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => return result,
        _ = shutdown_signal => {
            warn!("Interrupt received, stopping after the current step...");
            cancel.cancel();
        }
    }
    work.await
}
