pub mod logging {
    use std::fmt;
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::subscriber::SetGlobalDefaultError;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "FACELINK_LOG_FILTER";
    const TRACE_DEPS_ENV: &str = "FACELINK_TRACE_DEPS";

    /// Chatty at debug and trace; the ICE and SCTP stacks drown everything else out.
    const NOISY_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_mdns",
        "webrtc_data",
        "turn",
        "stun",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        fn directives(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "info,facelink=debug,signal_store=debug",
                LogLevel::Trace => "info,facelink=trace,signal_store=trace",
            }
        }
    }

    impl fmt::Display for LogLevel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.to_possible_value() {
                Some(value) => f.write_str(value.get_name()),
                None => Ok(()),
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {}: {source}", .path.display())]
        OpenLogFile {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("another global subscriber is already installed")]
        Install(#[from] SetGlobalDefaultError),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber. Once one is installed, later calls do nothing.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let (filter, throttled) = match std::env::var(FILTER_ENV) {
            Ok(directives) => (directives, false),
            Err(_) => filter_directives(config.level, dependency_tracing_requested()),
        };
        let (writer, guard) = open_writer(config.file.as_deref())?;

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        let _ = GUARD.set(guard);

        tracing::debug!(level = %config.level, %filter, "logging ready");
        if throttled {
            tracing::debug!(
                "webrtc internals capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = file else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::OpenLogFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

    fn dependency_tracing_requested() -> bool {
        std::env::var(TRACE_DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    /// Filter for `level`, plus whether the webrtc targets were capped.
    fn filter_directives(level: LogLevel, trace_deps: bool) -> (String, bool) {
        let mut filter = level.directives().to_owned();
        if level < LogLevel::Debug || trace_deps {
            return (filter, false);
        }
        for target in NOISY_TARGETS {
            filter.push_str(&format!(",{target}=info"));
        }
        (filter, true)
    }

}
