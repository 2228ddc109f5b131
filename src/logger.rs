use chrono::Utc;
use env_logger::{Builder, Env, Target};
use std::io::Write;

/// Log to stderr; stdout carries prompts and summaries.
///
/// `RUST_LOG` wins when set. Otherwise `--debug` raises only mose's own
/// targets to debug; dependencies stay at info.
pub fn init_logger(debug: bool) {
    let default_filter = if debug { "info,mose=debug" } else { "info" };

    Builder::from_env(Env::default().default_filter_or(default_filter))
        .target(Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
