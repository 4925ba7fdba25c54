/// Words per chunk in the ingest pipeline.
pub const DEFAULT_WINDOW: usize = 1200;

/// Words shared between consecutive chunks.
pub const DEFAULT_OVERLAP: usize = 150;

/// Characters captured on each side of a contradiction match.
pub const CONTEXT_RADIUS: usize = 100;

/// Minimum pole label length (characters, after normalization).
pub const MIN_POLE_LEN: usize = 3;

/// Scar valence assigned to heuristically extracted tensions.
pub const DEFAULT_SCAR: f64 = 0.5;

/// Life-phase weight when nothing better is known.
pub const DEFAULT_PHASE_WEIGHT: f64 = 0.5;

/// Multiplier on the refusal term when a tension carries a refusal flag.
pub const REFUSAL_BOOST: f64 = 1.2;

/// Multiplier on the bias term for balanced collapse.
pub const BALANCED_BOOST: f64 = 1.1;

/// Rule 2: refuse once a refusal tension has been refused more often than this.
pub const DEFAULT_REFUSAL_COUNT_THRESHOLD: u32 = 5;

/// Rule 3: refuse when any retrieved scar exceeds this.
pub const DEFAULT_EXTREME_SCAR: f64 = 0.95;

/// Strictness policy: refuse when the refusal score reaches this.
pub const DEFAULT_STRICTNESS: f64 = 0.8;

/// Strictness policy: how many refusal tensions feed the score.
pub const STRICTNESS_TOP_N: usize = 3;

/// Strictness policy: per-pole boost when the query names a pole.
pub const POLE_OVERLAP_BOOST: f64 = 0.15;

/// Strictness policy: boost for late-life tensions, scaled by phase weight.
pub const LATE_PHASE_BOOST: f64 = 0.2;

/// Default number of tensions kept per query.
pub const DEFAULT_TOP_K: usize = 10;

/// Default embedding dimensionality for the hashing embedder.
pub const DEFAULT_DIMENSIONS: usize = 768;

/// Tolerance for the weight-sum check.
pub const WEIGHT_EPSILON: f64 = 1e-9;

/// Separator used when embedding a pole pair as a passage.
pub const PAIR_SEPARATOR: &str = "[VS]";
