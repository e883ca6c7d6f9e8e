//!
//! log system
//!

use {
    std::env, std::io, tracing_subscriber::filter::LevelFilter,
    tracing_subscriber::EnvFilter,
};

/// Install the process-wide tracing subscriber.
///
/// `verbose` raises one module (or everything, if empty) to `debug`;
/// `RUST_LOG` directives are layered on top. Calling this twice is a no-op.
pub fn init_logging(verbose: Option<&str>) {
    let mut env_filter = EnvFilter::new("pchain_ledger=info");
    if let Some(module) = verbose {
        if module.is_empty() {
            env_filter = env_filter.add_directive(LevelFilter::DEBUG.into());
        } else {
            match format!("{module}=debug").parse() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(err) => eprintln!("Ignoring module `{module}`: {err}"),
            }
        }
    }

    if let Ok(rust_log) = env::var("RUST_LOG") {
        if !rust_log.is_empty() {
            for directive in rust_log.split(',').filter_map(|s| match s.parse() {
                Ok(directive) => Some(directive),
                Err(err) => {
                    eprintln!("Ignoring directive `{s}`: {err}");
                    None
                }
            }) {
                env_filter = env_filter.add_directive(directive);
            }
        }
    } else {
        env_filter = env_filter.add_directive(LevelFilter::WARN.into());
    }

    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init();
}
