use std::time::Duration;

use crate::engine::TamperCategory;

/// Parse `"<n>[ms|s|m|h]"`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("duration {:?} has no number", s));
    }
    let n: u64 = digits
        .parse()
        .map_err(|e| format!("duration {:?}: {}", s, e))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(format!("unknown duration unit {:?} in {:?}", other, s)),
    }
}

/// Parse a comma-separated category list (`"app_info, overlay_permission"`).
pub fn parse_categories(s: &str) -> Result<Vec<TamperCategory>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            serde_json::from_value(serde_json::Value::String(item.to_string()))
                .map_err(|_| format!("unknown tamper category {:?}", item))
        })
        .collect()
}

/// Parse a comma-separated string list, dropping empty items.
pub fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration(" 45 "), Ok(Duration::from_secs(45)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn category_list() {
        assert_eq!(
            parse_categories("app_info, overlay_permission"),
            Ok(vec![TamperCategory::AppInfo, TamperCategory::OverlayPermission])
        );
        assert_eq!(parse_categories(""), Ok(vec![]));
        assert!(parse_categories("app_info,camera").is_err());
    }
}
