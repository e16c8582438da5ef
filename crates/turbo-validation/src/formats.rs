//! String format checks backing [`Constraint::Format`](crate::Constraint::Format).

use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap()
});

static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").unwrap()
});

static UUID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[1-8][0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$")
        .unwrap()
});

static DATE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

static TIME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([01]\d|2[0-3]):([0-5]\d):([0-5]\d)(\.\d{1,9})?$").unwrap()
});

/// Predefined string formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    Email,
    Url,
    Uuid,
    /// ISO 8601 / RFC 3339 timestamp
    DateTime,
    /// YYYY-MM-DD
    Date,
    /// HH:MM:SS with optional fraction
    Time,
}

impl StringFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Url => "URL",
            Self::Uuid => "UUID",
            Self::DateTime => "datetime",
            Self::Date => "date",
            Self::Time => "time",
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Email => EMAIL_REGEX.is_match(value),
            Self::Url => URL_REGEX.is_match(value),
            Self::Uuid => UUID_REGEX.is_match(value),
            Self::DateTime => chrono::DateTime::parse_from_rfc3339(value).is_ok(),
            Self::Date => {
                DATE_REGEX.is_match(value)
                    && chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
            }
            Self::Time => TIME_REGEX.is_match(value),
        }
    }
}
