/// Column-name constants for profile-qc.
/// Single source of truth - exported to Python via PyO3.

// ── Flag columns ────────────────────────────────────────────────────────────
pub mod flag_field {
    /// Automatic per-routine flag history, one character per routine.
    pub const AUTO_PREFIX: &str = "Q0_";
    /// Primary flag, seeded from the automatic flags.
    pub const PRIMARY_PREFIX: &str = "Q_";
    /// Any column starting with this is flag-bearing and never gets its own flags.
    pub const FLAG_MARKER: char = 'Q';

    pub fn auto_key(parameter: &str) -> String {
        format!("{AUTO_PREFIX}{parameter}")
    }

    pub fn primary_key(auto_key: &str) -> String {
        match auto_key.strip_prefix(AUTO_PREFIX) {
            Some(parameter) => format!("{PRIMARY_PREFIX}{parameter}"),
            None => format!("{PRIMARY_PREFIX}{auto_key}"),
        }
    }
}

// ── Cast metadata columns ───────────────────────────────────────────────────
pub mod meta {
    pub const YEAR: &str = "YEAR";
    pub const MONTH: &str = "MONTH";
    pub const DAY: &str = "DAY";
    pub const HOUR: &str = "HOUR";
    pub const MINUTE: &str = "MINUTE";
    pub const SECOND: &str = "SECOND";
    pub const CRUISE: &str = "CRUISE";
    pub const STATION: &str = "STATION";
    pub const LATITUDE_DD: &str = "LATITUDE_DD";
    pub const LONGITUDE_DD: &str = "LONGITUDE_DD";
    pub const COMNT_SAMP: &str = "COMNT_SAMP";
    pub const SCAN_BIN_CTD: &str = "SCAN_BIN_CTD";

    pub const ALL: [&str; 12] = [
        YEAR,
        MONTH,
        DAY,
        HOUR,
        MINUTE,
        SECOND,
        CRUISE,
        STATION,
        LATITUDE_DD,
        LONGITUDE_DD,
        COMNT_SAMP,
        SCAN_BIN_CTD,
    ];

    pub fn is_meta(key: &str) -> bool {
        ALL.contains(&key)
    }
}

// ── Measured parameters with special roles ──────────────────────────────────
pub mod parameter {
    /// Pressure is reported alongside every failing value in the run log.
    pub const PRESSURE: &str = "PRES_CTD";
}

// ── Area override sheet columns ─────────────────────────────────────────────
pub mod area_sheet {
    pub const PARAMETER: &str = "PARAMETER";
    pub const AREA_NAME: &str = "AREA_NAME";
    pub const SEASON: &str = "SEASON";
    pub const MONTHS: &str = "MONTHS";

    pub const KEYS: [&str; 4] = [PARAMETER, AREA_NAME, SEASON, MONTHS];
}

// ── Threshold field names (catalog YAML and override sheets) ────────────────
pub mod threshold {
    pub const MIN_RANGE_VALUE: &str = "min_range_value";
    pub const MAX_RANGE_VALUE: &str = "max_range_value";
    pub const ACCEPTABLE_ERROR: &str = "acceptable_error";
    pub const ACCEPTABLE_STDDEV_FACTOR: &str = "acceptable_stddev_factor";
    pub const MIN_STDDEV_VALUE: &str = "min_stddev_value";
    pub const Q_FLAG: &str = "q_flag";
}

/// Column names carry units after the first space, e.g. `TEMP_CTD [°C]`.
pub fn column_stem(column: &str) -> &str {
    column.split(' ').next().unwrap_or(column)
}
