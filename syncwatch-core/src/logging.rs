//! Tracing subscriber setup

use std::sync::Once;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Directives applied on top of `RUST_LOG`
const DEFAULT_DIRECTIVES: &[&str] = &["syncwatch_core=debug", "syncwatch=info", "rustls=warn"];

/// Install the global fmt subscriber. Safe to call more than once; only the
/// first call has an effect, and an already-installed subscriber is left alone.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env();
        for directive in DEFAULT_DIRECTIVES {
            match directive.parse::<Directive>() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("ignoring log directive {directive}: {e}"),
            }
        }

        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
