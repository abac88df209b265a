//! Parsing of stored setting values.

use std::fmt::Display;
use std::str::FromStr;

use cellpipe_pipeline::ModuleError;
use cellpipe_pipeline::setting::parse_binary;

/// Fail unless exactly `expected` values were stored.
pub fn expect_count(values: &[String], expected: usize) -> Result<(), ModuleError> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(ModuleError::SettingCount {
            expected,
            actual: values.len(),
        })
    }
}

/// Parse `values[index]`, labelling any failure with the setting's text.
pub fn parse<T>(values: &[String], index: usize, text: &str) -> Result<T, ModuleError>
where
    T: FromStr,
    T::Err: Display,
{
    let value = values.get(index).map_or("", String::as_str);
    value.trim().parse().map_err(|e: T::Err| ModuleError::InvalidSetting {
        index,
        text: text.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an optional number; an empty value means "not set".
pub fn parse_optional(values: &[String], index: usize, text: &str) -> Result<Option<f64>, ModuleError> {
    if values.get(index).is_none_or(|v| v.trim().is_empty()) {
        return Ok(None);
    }
    parse(values, index, text).map(Some)
}

/// Parse a Yes/No value.
pub fn parse_flag(values: &[String], index: usize, text: &str) -> Result<bool, ModuleError> {
    let value = values.get(index).map_or("", String::as_str);
    parse_binary(value).ok_or_else(|| ModuleError::InvalidSetting {
        index,
        text: text.to_string(),
        value: value.to_string(),
        reason: "expected Yes or No".to_string(),
    })
}

/// Format an optional number; `None` becomes an empty value.
pub fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn parse_reports_setting_text() {
        let err = parse::<f64>(&values(&["abc"]), 0, "Threshold").unwrap_err();
        assert!(err.to_string().contains("Threshold"));
        assert!(err.to_string().contains("\"abc\""));
        assert!((parse::<f64>(&values(&[" 0.5 "]), 0, "Threshold").unwrap() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn optional_and_flag_values() {
        let v = values(&["", "2", "Yes", "maybe"]);
        assert_eq!(parse_optional(&v, 0, "Min").unwrap(), None);
        assert_eq!(parse_optional(&v, 1, "Max").unwrap(), Some(2.0));
        assert!(parse_flag(&v, 2, "Skip").unwrap());
        assert!(parse_flag(&v, 3, "Skip").is_err());
        assert_eq!(format_optional(None), "");
        assert!(matches!(expect_count(&v, 3), Err(ModuleError::SettingCount { expected: 3, actual: 4 })));
    }
}
