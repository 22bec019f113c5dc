//! Rolling file logs for the shell crates.
//!
//! # Responsibility
//! - Route `event=<name> module=<module> status=<status>` lines from the core
//!   crate and its frontends into size-rotated files.
//! - Let callers tune verbosity per component with a directive such as
//!   `info,loader=debug,cache=trace`.
//!
//! # Invariants
//! - The first successful `init_logging` wins for the whole process; later
//!   calls succeed only with an equivalent directive and the same directory.
//! - Third-party crates never log above `warn`.
//! - Nothing here panics.

use flexi_logger::{
    Cleanup, Criterion, FileSpec, LogSpecification, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const FILE_BASENAME: &str = "extshell";
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_FILES: usize = 5;
const PANIC_TEXT_LIMIT: usize = 160;

/// Crates whose records follow the directive's base level.
const SHELL_CRATES: [&str; 2] = ["extshell_core", "extshell"];

/// Core modules that accept a `component=level` override.
pub const COMPONENTS: [&str; 9] = [
    "cache",
    "config",
    "db",
    "events",
    "extension",
    "loader",
    "registry",
    "resolver",
    "storage",
];

static ACTIVE: OnceCell<ActiveLogging> = OnceCell::new();

struct ActiveLogging {
    directive: LogDirective,
    log_dir: PathBuf,
    _handle: LoggerHandle,
}

/// Parsed verbosity directive: a base level plus per-component overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    base: LevelFilter,
    overrides: BTreeMap<&'static str, LevelFilter>,
}

impl LogDirective {
    /// Parses `base[,component=level]*`. Without a base level the build
    /// default from [`default_log_level`] applies.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut base = None;
        let mut overrides = BTreeMap::new();
        for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let Some((component, level)) = part.split_once('=') else {
                if base.replace(parse_level(part)?).is_some() {
                    return Err(format!("log directive `{raw}` sets the base level twice"));
                }
                continue;
            };
            let component = component.trim().to_ascii_lowercase();
            let Some(known) = COMPONENTS.iter().find(|known| **known == component) else {
                return Err(format!(
                    "unknown log component `{component}`; expected one of {}",
                    COMPONENTS.join("|")
                ));
            };
            if overrides.insert(*known, parse_level(level)?).is_some() {
                return Err(format!("log component `{known}` is set twice"));
            }
        }

        let base = match base {
            Some(level) => level,
            None => parse_level(default_log_level())?,
        };
        Ok(Self { base, overrides })
    }

    pub fn base(&self) -> LevelFilter {
        self.base
    }

    /// Effective level for one of [`COMPONENTS`].
    pub fn level_for(&self, component: &str) -> LevelFilter {
        self.overrides
            .get(component)
            .copied()
            .unwrap_or(self.base)
    }

    fn to_log_specification(&self) -> LogSpecification {
        let mut builder = LogSpecification::builder();
        builder.default(self.base.min(LevelFilter::Warn));
        for krate in SHELL_CRATES {
            builder.module(krate, self.base);
        }
        for (component, level) in &self.overrides {
            builder.module(format!("extshell_core::{component}"), *level);
        }
        builder.build()
    }
}

impl Display for LogDirective {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(level_name(self.base))?;
        for (component, level) in &self.overrides {
            write!(f, ",{component}={}", level_name(*level))?;
        }
        Ok(())
    }
}

/// Starts file logging under `log_dir` with a verbosity `directive`.
///
/// Repeating the call with an equivalent directive and the same directory is
/// a no-op; anything else is rejected once logging runs.
///
/// # Errors
/// - `directive` names an unknown level or component.
/// - `log_dir` is blank, relative, or cannot be created.
/// - The logger backend fails to start.
pub fn init_logging(directive: &str, log_dir: &str) -> Result<(), String> {
    let directive = LogDirective::parse(directive)?;
    let log_dir = absolute_dir(log_dir)?;
    let active = ACTIVE.get_or_try_init(|| start(&directive, &log_dir))?;

    if active.log_dir != log_dir {
        return Err(format!(
            "logging already writes to `{}`; refusing to switch to `{}`",
            active.log_dir.display(),
            log_dir.display()
        ));
    }
    if active.directive != directive {
        return Err(format!(
            "logging already runs with `{}`; refusing to switch to `{directive}`",
            active.directive
        ));
    }
    Ok(())
}

/// `(directive, log_dir)` of the running logger, if any.
pub fn logging_status() -> Option<(String, PathBuf)> {
    ACTIVE
        .get()
        .map(|active| (active.directive.to_string(), active.log_dir.clone()))
}

/// `debug` for debug builds, `info` otherwise.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start(directive: &LogDirective, log_dir: &Path) -> Result<ActiveLogging, String> {
    std::fs::create_dir_all(log_dir).map_err(|err| {
        format!(
            "failed to create log directory `{}`: {err}",
            log_dir.display()
        )
    })?;

    let handle = Logger::with(directive.to_log_specification())
        .log_to_file(
            FileSpec::default()
                .directory(log_dir)
                .basename(FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEEP_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(|err| format!("failed to start logger: {err}"))?;

    install_panic_hook();
    info!(
        "event=logging_init module=logging status=ok directive={directive} log_dir={} core_version={}",
        log_dir.display(),
        env!("CARGO_PKG_VERSION")
    );

    Ok(ActiveLogging {
        directive: directive.clone(),
        log_dir: log_dir.to_path_buf(),
        _handle: handle,
    })
}

fn absolute_dir(raw: &str) -> Result<PathBuf, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("log directory cannot be empty".to_string());
    }
    let path = Path::new(trimmed);
    if !path.is_absolute() {
        return Err(format!("log directory must be absolute, got `{trimmed}`"));
    }
    Ok(path.to_path_buf())
}

fn parse_level(raw: &str) -> Result<LevelFilter, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::Off),
        "error" => Ok(LevelFilter::Error),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        other => Err(format!(
            "unsupported log level `{other}`; expected off|error|warn|info|debug|trace"
        )),
    }
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Chains a hook that records panics before the previous hook runs.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map_or_else(
            || "unknown".to_string(),
            |at| format!("{}:{}", at.file(), at.line()),
        );
        // Payloads can echo manifest text.
        let payload = single_line(&panic_text(info.payload()), PANIC_TEXT_LIMIT);
        error!("event=panic module=logging status=error location={location} payload={payload}");
        previous(info);
    }));
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn single_line(text: &str, limit: usize) -> String {
    let mut line: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .take(limit)
        .collect();
    if text.chars().count() > limit {
        line.push_str("...");
    }
    line
}
