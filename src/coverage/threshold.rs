//! Coverage threshold classification

use colored::{ColoredString, Colorize};

pub const DEFAULT_WARNING_CEILING: f64 = 80.0;
pub const DEFAULT_ERROR_CEILING: f64 = 50.0;

/// Qualitative classification of a percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Ok,
    Warning,
    Error,
    /// No value to classify, e.g. a file without baseline
    Neutral,
}

impl Tier {
    /// Badge color name understood by shields.io
    pub fn color(&self) -> &'static str {
        match self {
            Tier::Ok => "green",
            Tier::Warning => "yellow",
            Tier::Error => "red",
            Tier::Neutral => "lightgrey",
        }
    }

    /// Inline marker used in markdown table cells
    pub fn marker(&self) -> &'static str {
        match self {
            Tier::Ok => "🟢",
            Tier::Warning => "🟡",
            Tier::Error => "🔴",
            Tier::Neutral => "⚪",
        }
    }

    /// Color `text` for terminal output
    pub fn paint(&self, text: &str) -> ColoredString {
        match self {
            Tier::Ok => text.green(),
            Tier::Warning => text.yellow(),
            Tier::Error => text.red(),
            Tier::Neutral => text.dimmed(),
        }
    }
}

/// Tier boundaries. Values below `error` are errors, below `warning` warnings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning: f64,
    pub error: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: DEFAULT_WARNING_CEILING,
            error: DEFAULT_ERROR_CEILING,
        }
    }
}

impl Thresholds {
    pub fn new(warning: f64, error: f64) -> Self {
        Self { warning, error }
    }

    pub fn classify(&self, value: Option<f64>) -> Tier {
        classify(value, self.warning, self.error)
    }
}

/// Map a percentage to a tier. The error ceiling is checked first, so a
/// misconfigured pair (error above warning) never hides low values.
pub fn classify(value: Option<f64>, warning_ceiling: f64, error_ceiling: f64) -> Tier {
    match value {
        None => Tier::Neutral,
        Some(v) if v < error_ceiling => Tier::Error,
        Some(v) if v < warning_ceiling => Tier::Warning,
        Some(_) => Tier::Ok,
    }
}

/// Round to 2 decimal places, half away from zero
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `12.345` -> `"12.35"`
pub fn format_number(value: f64) -> String {
    format!("{:.2}", round2(value))
}

/// Signed variant for differences: `"+1.25"`, `"-5.00"`, `"0.00"`
pub fn format_delta(value: f64) -> String {
    let rounded = round2(value);
    if rounded > 0.0 {
        format!("+{:.2}", rounded)
    } else if rounded < 0.0 {
        format!("{:.2}", rounded)
    } else {
        "0.00".to_string()
    }
}
