//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Cut `s` to at most `max` characters, ending in "..." when shortened.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
  if s.chars().count() <= max {
    return s.to_string();
  }
  let keep = max.saturating_sub(3);
  let mut out: String = s.chars().take(keep).collect();
  out.push_str("...");
  out
}

/// Log-safe preview of user text (char-boundary safe).
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.chars().count() <= max {
    s.to_string()
  } else {
    format!("{}… ({} bytes total)", s.chars().take(max).collect::<String>(), s.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fill_template_replaces_keys() {
    assert_eq!(fill_template("Hi {name}, {name}!", &[("name", "Ana")]), "Hi Ana, Ana!");
    assert_eq!(fill_template("{missing}", &[]), "{missing}");
  }

  #[test]
  fn truncate_counts_chars_not_bytes() {
    assert_eq!(truncate_with_ellipsis("short", 30), "short");
    let long = "é".repeat(40);
    let cut = truncate_with_ellipsis(&long, 30);
    assert_eq!(cut.chars().count(), 30);
    assert!(cut.ends_with("..."));
  }

  #[test]
  fn trunc_for_log_keeps_short_text() {
    assert_eq!(trunc_for_log("abc", 10), "abc");
    assert!(trunc_for_log("abcdef", 3).starts_with("abc…"));
  }
}
