pub mod cli;
pub mod cmd;

use shadow_rs::shadow;

shadow!(build);

#[cfg(test)]
mod tests {

    #[cfg(test)]
    #[ctor::ctor]
    fn init() {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "debug".into());
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}
