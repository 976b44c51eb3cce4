//! Runtime configuration.

use crate::error::Error;
use crate::occupancy::MAX_SLOTS_PER_CORE;
use std::time::Duration;

/// Configuration for the runtime, built either programmatically or by
/// extracting the runtime's own options from a command line.
///
/// # Examples
///
/// ```
/// use arachne::Config;
///
/// let config = Config::new().num_cores(2).stack_size(256 * 1024);
/// ```
///
/// Extracting options from an argument vector, leaving everything the
/// runtime does not recognize untouched:
///
/// ```
/// use arachne::Config;
///
/// let mut args = vec![
///     "server".to_string(),
///     "--num-cores".to_string(),
///     "2".to_string(),
///     "--port=8080".to_string(),
/// ];
/// let config = Config::from_args(&mut args);
/// assert_eq!(args, ["server", "--port=8080"]);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) num_cores: usize,
    pub(crate) max_num_cores: Option<usize>,
    pub(crate) stack_size: usize,
    pub(crate) slots_per_core: usize,
    pub(crate) estimation_interval: Duration,
    pub(crate) grow_cooldown: Duration,
    pub(crate) drain_window: Duration,
    pub(crate) load_factor_threshold: f64,
    pub(crate) idle_core_fraction_hysteresis: f64,
    pub(crate) slot_occupancy_threshold: f64,
}

/// The default user-stack size: 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// The smallest accepted user-stack size. Must hold the seeded register
/// frame, the landing pad, and enough room to actually run user code.
const MIN_STACK_SIZE: usize = 4096;

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cores: 1,
            max_num_cores: None,
            stack_size: DEFAULT_STACK_SIZE,
            slots_per_core: MAX_SLOTS_PER_CORE,
            estimation_interval: Duration::from_millis(50),
            grow_cooldown: Duration::from_millis(100),
            drain_window: Duration::from_secs(1),
            load_factor_threshold: 1.25,
            idle_core_fraction_hysteresis: 0.2,
            slot_occupancy_threshold: 0.5,
        }
    }
}

impl Config {
    /// Returns a configuration with the defaults: one initial core, a
    /// maximum of one core per available CPU, and 1 MiB stacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of scheduling cores started by [`init`](crate::init).
    /// Defaults to 1; the runtime grows toward the maximum under load.
    #[must_use]
    pub fn num_cores(self, num_cores: usize) -> Self {
        Self { num_cores, ..self }
    }

    /// The upper bound on scheduling cores. Defaults to the number of CPUs
    /// available to the process.
    #[must_use]
    pub fn max_num_cores(self, max_num_cores: usize) -> Self {
        Self {
            max_num_cores: Some(max_num_cores),
            ..self
        }
    }

    /// The size of each user thread's stack, in bytes.
    #[must_use]
    pub fn stack_size(self, stack_size: usize) -> Self {
        Self { stack_size, ..self }
    }

    /// The number of thread slots on each core, at most
    /// [`MAX_SLOTS_PER_CORE`](crate::MAX_SLOTS_PER_CORE).
    #[must_use]
    pub fn slots_per_core(self, slots_per_core: usize) -> Self {
        Self {
            slots_per_core,
            ..self
        }
    }

    /// How often the load estimator samples aggregate statistics and decides
    /// whether to grow or shrink the core pool.
    #[must_use]
    pub fn estimation_interval(self, estimation_interval: Duration) -> Self {
        Self {
            estimation_interval,
            ..self
        }
    }

    /// The minimum delay between successive pressure-triggered core
    /// increments.
    #[must_use]
    pub fn grow_cooldown(self, grow_cooldown: Duration) -> Self {
        Self {
            grow_cooldown,
            ..self
        }
    }

    /// How long a core selected for retirement may keep draining before the
    /// retirement is abandoned.
    #[must_use]
    pub fn drain_window(self, drain_window: Duration) -> Self {
        Self {
            drain_window,
            ..self
        }
    }

    /// Extracts the runtime's own options from `args`, removing every
    /// recognized option (and its value) and leaving the rest in place.
    ///
    /// Recognized options: `--num-cores N`, `--max-num-cores N`, and
    /// `--stack-size BYTES`, each accepting `--option value` or
    /// `--option=value`. A malformed value is reported to the error stream
    /// and the option is ignored.
    pub fn from_args(args: &mut Vec<String>) -> Self {
        let mut config = Self::default();
        let mut parsed = Vec::with_capacity(args.len());
        let mut iter = std::mem::take(args).into_iter();

        while let Some(arg) = iter.next() {
            let (name, inline_value) = match arg.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (arg.clone(), None),
            };
            if !matches!(
                name.as_str(),
                "--num-cores" | "--max-num-cores" | "--stack-size"
            ) {
                parsed.push(arg);
                continue;
            }
            let value = match inline_value.or_else(|| iter.next()) {
                Some(value) => value,
                None => {
                    crate::runtime::write_error(format_args!(
                        "ignoring option {name}: missing value\n"
                    ));
                    continue;
                }
            };
            let value: usize = match value.parse() {
                Ok(value) => value,
                Err(_) => {
                    crate::runtime::write_error(format_args!(
                        "ignoring option {name}: invalid value {value:?}\n"
                    ));
                    continue;
                }
            };
            match name.as_str() {
                "--num-cores" => config.num_cores = value,
                "--max-num-cores" => config.max_num_cores = Some(value),
                "--stack-size" => config.stack_size = value,
                _ => unreachable!(),
            }
        }

        *args = parsed;
        config
    }

    /// Validates the configuration, resolving the default core maximum.
    pub(crate) fn validated(mut self) -> Result<Self, Error> {
        let available = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        let max = *self.max_num_cores.get_or_insert(available.max(self.num_cores));
        if self.num_cores == 0 {
            return Err(Error::InvalidConfig("num_cores must be at least 1"));
        }
        if max < self.num_cores {
            return Err(Error::InvalidConfig(
                "max_num_cores must be at least num_cores",
            ));
        }
        if self.slots_per_core == 0 || self.slots_per_core > MAX_SLOTS_PER_CORE {
            return Err(Error::InvalidConfig("slots_per_core must be in 1..=56"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidConfig("stack_size below minimum (4 KiB)"));
        }
        Ok(self)
    }

    pub(crate) fn max_cores(&self) -> usize {
        self.max_num_cores.expect("config must be validated first")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_known_options() {
        let mut argv = args(&["prog", "--num-cores", "3", "--stack-size=65536", "run"]);
        let config = Config::from_args(&mut argv);
        assert_eq!(config.num_cores, 3);
        assert_eq!(config.stack_size, 65536);
        assert_eq!(argv, args(&["prog", "run"]));
    }

    #[test]
    fn passes_unknown_options_through() {
        let mut argv = args(&["prog", "--verbose", "--max-num-cores=4", "--port", "80"]);
        let config = Config::from_args(&mut argv);
        assert_eq!(config.max_num_cores, Some(4));
        assert_eq!(argv, args(&["prog", "--verbose", "--port", "80"]));
    }

    #[test]
    fn malformed_value_is_ignored() {
        let mut argv = args(&["--num-cores", "lots"]);
        let config = Config::from_args(&mut argv);
        assert_eq!(config.num_cores, Config::default().num_cores);
        assert!(argv.is_empty());
    }

    #[test]
    fn validation_rejects_nonsense() {
        assert!(Config::new().num_cores(0).validated().is_err());
        assert!(Config::new()
            .num_cores(4)
            .max_num_cores(2)
            .validated()
            .is_err());
        assert!(Config::new().slots_per_core(57).validated().is_err());
        assert!(Config::new().stack_size(64).validated().is_err());
        assert!(Config::new().validated().is_ok());
    }

    #[test]
    fn default_max_covers_requested_cores() {
        let config = Config::new().num_cores(64).validated().unwrap();
        assert!(config.max_cores() >= 64);
    }
}
