//! Server startup utilities.

use redka_config::AppConfig;
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    ____           ____
   / __ \___  ____/ / /______ _
  / /_/ / _ \/ __  / //_/ __ `/
 / _, _/  __/ /_/ / ,< / /_/ /
/_/ |_|\___/\__,_/_/|_|\__,_/
    "#);
}

/// Prints scheduler startup information.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    let jobs = &config.jobs;
    info!("{}", separator);
    info!("Environment:   {}", config.app.environment);
    info!("Redis:         {}", jobs.redis.url);
    info!("Key prefix:    {}", jobs.redis.key_prefix);
    info!(
        "Delay manager: {}",
        if jobs.delay.enabled { "enabled" } else { "disabled" }
    );
    info!("Batches:       {}", jobs.batches.len());
    info!("{}", separator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_banner_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_banner();
    }

    #[test]
    fn test_print_startup_info_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_startup_info(&AppConfig::default());
    }
}
