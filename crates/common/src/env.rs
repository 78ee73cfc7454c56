use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

use tracing_subscriber::EnvFilter;

/// Resolve one knob: the environment variable `name` if it is set and
/// parses, `default` otherwise. Overrides are logged so a deployment's
/// effective configuration can be read off its startup output; values
/// that fail to parse are logged and ignored rather than aborting the
/// service.
pub fn env_config<T>(name: &str, default: T) -> T
where
    T: FromStr + Debug,
    T::Err: Debug,
{
    let raw = match env::var(name) {
        Ok(raw) => raw,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(_)) => {
            tracing::warn!("Knob {name} is set but is not valid unicode; keeping {default:?}");
            return default;
        },
    };
    match raw.parse::<T>() {
        Ok(value) => {
            tracing::info!("Knob {name} overridden to {value:?} by the environment");
            value
        },
        Err(e) => {
            tracing::warn!(
                "Knob {name} has unparsable value {raw:?} ({e:?}); keeping {default:?}"
            );
            default
        },
    }
}

/// Install the tracing subscriber for a service binary. `RUST_LOG`
/// controls the filter (default `info`), `LOG_FORMAT` selects `json` or
/// `pretty` output, and `NO_COLOR` disables ANSI escapes.
pub fn config_service() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(env::var("NO_COLOR").is_err());
    match env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        Ok("pretty") => builder.pretty().init(),
        _ => builder.init(),
    }
}

/// Best-effort subscriber setup for tests. Tests in one binary race to
/// install the global subscriber, so a failed install just means another
/// test got there first.
pub fn config_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
