//! Resilience policy: batch sizing, memory pressure response, GC cadence.
//!
//! The governor is pure policy.  Its only contact with the outside world
//! is a `MemoryProbe`, behind which platform-specific resident-set
//! readings plug in; everything else is arithmetic on observed counters,
//! so the adaptive rules are testable with a scripted probe.

use crate::config::Profile;

/// Floor and ceiling for the adaptive batch size.
pub const MIN_BATCH: usize = 5;
pub const MAX_BATCH: usize = 400;

/// Memory release points are scheduled every this many records.
pub const GC_CADENCE: u64 = 1_000;

/// Reads the process's resident set size.
pub trait MemoryProbe: Send {
    /// Current RSS in bytes, or `None` where the platform offers no
    /// cheap reading (the adaptive rules then stay inert).
    fn rss(&self) -> Option<u64>;
}

/// Linux probe over `/proc/self/statm`.
pub struct ProcStatusProbe;

impl MemoryProbe for ProcStatusProbe {
    fn rss(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
}

/// Probe for platforms without a supported RSS source.
pub struct NullProbe;

impl MemoryProbe for NullProbe {
    fn rss(&self) -> Option<u64> {
        None
    }
}

pub fn default_probe() -> Box<dyn MemoryProbe> {
    if cfg!(target_os = "linux") {
        Box::new(ProcStatusProbe)
    } else {
        Box::new(NullProbe)
    }
}

/// The resolved settings bundle for one table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileSettings {
    pub profile: Profile,
    pub batch_size: usize,
    pub memory_limit: u64,
    pub streaming: bool,
    pub parallel: bool,
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn settings_of(profile: Profile) -> ProfileSettings {
    match profile {
        Profile::Small => ProfileSettings {
            profile: Profile::Small,
            batch_size: 200,
            memory_limit: 200 * MIB,
            streaming: false,
            parallel: false,
        },
        Profile::Medium => ProfileSettings {
            profile: Profile::Medium,
            batch_size: 100,
            memory_limit: 500 * MIB,
            streaming: true,
            parallel: false,
        },
        Profile::Large => ProfileSettings {
            profile: Profile::Large,
            batch_size: 50,
            memory_limit: GIB,
            streaming: true,
            parallel: true,
        },
        Profile::Enterprise => ProfileSettings {
            profile: Profile::Enterprise,
            batch_size: 25,
            memory_limit: 2 * GIB,
            streaming: true,
            parallel: true,
        },
        // Auto resolves through classify(); treat a direct call as medium.
        Profile::Auto => settings_of(Profile::Medium),
    }
}

/// Selects a profile from the configured choice and the estimated
/// on-disk size of the table.
pub fn classify(configured: Profile, estimated_bytes: u64) -> ProfileSettings {
    let profile = match configured {
        Profile::Auto => {
            if estimated_bytes < 10 * MIB {
                Profile::Small
            } else if estimated_bytes < GIB {
                Profile::Medium
            } else if estimated_bytes < 10 * GIB {
                Profile::Large
            } else {
                Profile::Enterprise
            }
        }
        fixed => fixed,
    };
    settings_of(profile)
}

/// Advice returned after every completed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchAdvice {
    /// Shrink buffers and ask SQLite to give memory back.
    pub release_memory: bool,
    /// The limit is exceeded and no remediation is left; the run must
    /// abort.
    pub over_limit: bool,
}

/// Tracks memory and adapts the batch size for one table's conversion.
pub struct Governor {
    settings: ProfileSettings,
    memory_limit: u64,
    batch_size: usize,
    low_streak: u8,
    records_since_release: u64,
    probe: Box<dyn MemoryProbe>,
}

impl Governor {
    pub fn new(
        settings: ProfileSettings,
        memory_limit_override: Option<u64>,
        probe: Box<dyn MemoryProbe>,
    ) -> Governor {
        Governor {
            settings,
            memory_limit: memory_limit_override.unwrap_or(settings.memory_limit),
            batch_size: settings.batch_size.clamp(MIN_BATCH, MAX_BATCH),
            low_streak: 0,
            records_since_release: 0,
            probe,
        }
    }

    pub fn settings(&self) -> &ProfileSettings {
        &self.settings
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// Adjusts the batch size from the current RSS reading.
    ///
    /// Above 85% of the limit the batch halves (floor 5) and a memory
    /// release is requested; below 40% for three consecutive batches it
    /// grows by half (cap 400).
    pub fn after_batch(&mut self, rows_written: usize, _bytes_written: u64) -> BatchAdvice {
        self.records_since_release += rows_written as u64;
        let rss = match self.probe.rss() {
            Some(r) => r,
            None => return BatchAdvice::default(),
        };
        let mut advice = BatchAdvice::default();
        if rss * 100 > self.memory_limit * 85 {
            let already_floored = self.batch_size == MIN_BATCH;
            self.batch_size = (self.batch_size / 2).max(MIN_BATCH);
            self.low_streak = 0;
            advice.release_memory = true;
            // Exceeding the limit itself with the batch already at the
            // floor means remediation is exhausted.
            advice.over_limit = rss > self.memory_limit && already_floored;
        } else if rss * 100 < self.memory_limit * 40 {
            self.low_streak += 1;
            if self.low_streak >= 3 {
                self.batch_size = (self.batch_size * 3 / 2).min(MAX_BATCH);
                self.low_streak = 0;
            }
        } else {
            self.low_streak = 0;
        }
        advice
    }

    /// True when the periodic release point is due, counted in records.
    pub fn release_due(&mut self) -> bool {
        if self.records_since_release >= GC_CADENCE {
            self.records_since_release = 0;
            true
        } else {
            false
        }
    }
}
