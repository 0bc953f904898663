//! Canonical cache keys.
//!
//! The same builders are used for reactive-cache lookups and store
//! partition keys, so a store write is always visible to a later lookup
//! with equivalent inputs. Every builder returns `None` ("no key") when a
//! required field normalizes to empty; callers must never cache under a
//! degenerate key.
//!
//! Components are joined with `-`. A `-` or `%` inside a component is
//! percent-encoded first, so distinct identity tuples never share a key.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A canonical, normalized cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a study id, site code or variant: trimmed, lower-cased.
pub fn norm_id(value: &str) -> Option<String> {
    let v = value.trim().to_lowercase();
    (!v.is_empty()).then_some(v)
}

/// Normalize an HL language code: trimmed, case preserved.
pub fn norm_hl(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

/// Normalize an integer-ish field ("007", " 12 ") to its canonical decimal
/// form. Zero, negatives and non-numeric input yield `None`.
pub fn norm_int(value: &str) -> Option<String> {
    let n: u64 = value.trim().parse().ok()?;
    (n > 0).then(|| n.to_string())
}

fn norm_variant(variant: Option<&str>) -> Option<Option<String>> {
    match variant.map(str::trim) {
        None | Some("") | Some("null") | Some("undefined") => Some(None),
        Some(raw) => norm_id(raw).map(Some),
    }
}

fn escape(component: &str) -> Cow<'_, str> {
    if !component.contains(['-', '%']) {
        return Cow::Borrowed(component);
    }
    let mut out = String::with_capacity(component.len() + 4);
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            '-' => out.push_str("%2D"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn id_part(value: &str) -> Option<String> {
    norm_id(value).map(|v| escape(&v).into_owned())
}

fn hl_part(value: &str) -> Option<String> {
    norm_hl(value).map(|v| escape(&v).into_owned())
}

pub fn interface_key(hl: &str) -> Option<CacheKey> {
    let hl = hl_part(hl)?;
    Some(CacheKey(format!("interface-{}", hl)))
}

pub fn common_content_key(study: &str, hl: &str, variant: Option<&str>) -> Option<CacheKey> {
    let study = id_part(study)?;
    let hl = hl_part(hl)?;
    let key = match norm_variant(variant)? {
        Some(v) => format!("commonContent-{}-{}-v-{}", study, hl, escape(&v)),
        None => format!("commonContent-{}-{}", study, hl),
    };
    Some(CacheKey(key))
}

pub fn lesson_content_key(study: &str, hl: &str, jf: &str, lesson: &str) -> Option<CacheKey> {
    let study = id_part(study)?;
    let hl = hl_part(hl)?;
    let jf = norm_int(jf)?;
    let lesson = norm_int(lesson)?;
    Some(CacheKey(format!(
        "lessonContent-{}-{}-{}-lesson-{}",
        study, hl, jf, lesson
    )))
}

pub fn site_content_key(site: &str, hl: &str) -> Option<CacheKey> {
    let site = id_part(site)?;
    let hl = hl_part(hl)?;
    Some(CacheKey(format!("siteContent-{}-{}", site, hl)))
}

/// Notes key; `position` is optional and defaults to `0`.
pub fn notes_key(study: &str, lesson: &str, position: Option<&str>) -> Option<CacheKey> {
    let study = id_part(study)?;
    let lesson = norm_int(lesson)?;
    let position = position.and_then(norm_int).unwrap_or_else(|| "0".to_string());
    Some(CacheKey(format!("notes-{}-{}-{}", study, lesson, position)))
}

pub fn video_urls_key(study: &str, jf: &str) -> Option<CacheKey> {
    let study = id_part(study)?;
    let jf = norm_int(jf)?;
    Some(CacheKey(format!("videoUrls-{}-{}", study, jf)))
}

pub fn study_progress_key(study: &str) -> Option<CacheKey> {
    let study = id_part(study)?;
    Some(CacheKey(format!("progress-{}", study)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_interface_key_preserves_hl_case() {
        assert_eq!(
            interface_key(" zhHant ").map(|k| k.to_string()),
            Some("interface-zhHant".to_string())
        );
    }

    #[test]
    fn test_blank_fields_yield_no_key() {
        assert!(interface_key("   ").is_none());
        assert!(common_content_key("", "eng00", None).is_none());
        assert!(common_content_key("dbs", " ", None).is_none());
        assert!(lesson_content_key("dbs", "eng00", "", "1").is_none());
        assert!(lesson_content_key("dbs", "eng00", "529", "0").is_none());
        assert!(site_content_key("", "eng00").is_none());
        assert!(study_progress_key("\t").is_none());
    }

    #[test]
    fn test_study_id_is_lowercased() {
        assert_eq!(
            common_content_key(" DBS ", "eng00", None),
            common_content_key("dbs", "eng00", None)
        );
    }

    #[test]
    fn test_common_content_variant() {
        assert_eq!(
            common_content_key("dbs", "eng00", Some("Family")).unwrap().as_str(),
            "commonContent-dbs-eng00-v-family"
        );
        for absent in [None, Some(""), Some("null"), Some("undefined")] {
            assert_eq!(
                common_content_key("dbs", "eng00", absent).unwrap().as_str(),
                "commonContent-dbs-eng00"
            );
        }
    }

    #[test]
    fn test_lesson_key_strips_leading_zeros() {
        assert_eq!(
            lesson_content_key("dbs", "eng00", "0529", "03").unwrap().as_str(),
            "lessonContent-dbs-eng00-529-lesson-3"
        );
        assert!(lesson_content_key("dbs", "eng00", "abc", "3").is_none());
        assert!(lesson_content_key("dbs", "eng00", "-5", "3").is_none());
    }

    #[test]
    fn test_notes_key_defaults_position() {
        assert_eq!(notes_key("dbs", "2", None).unwrap().as_str(), "notes-dbs-2-0");
        assert_eq!(notes_key("dbs", "2", Some("x")).unwrap().as_str(), "notes-dbs-2-0");
        assert_eq!(notes_key("dbs", "2", Some("4")).unwrap().as_str(), "notes-dbs-2-4");
        assert!(notes_key("dbs", "", Some("4")).is_none());
    }

    #[test]
    fn test_other_keys() {
        assert_eq!(
            site_content_key("MyFriends", "eng00").unwrap().as_str(),
            "siteContent-myfriends-eng00"
        );
        assert_eq!(video_urls_key("dbs", "529").unwrap().as_str(), "videoUrls-dbs-529");
        assert_eq!(study_progress_key("Life").unwrap().as_str(), "progress-life");
    }

    #[test]
    fn test_separator_inside_component_is_escaped() {
        assert_ne!(
            common_content_key("a-b", "c", None),
            common_content_key("a", "b-c", None)
        );
        assert_ne!(
            common_content_key("dbs", "eng00-v-kids", None),
            common_content_key("dbs", "eng00", Some("kids"))
        );
        assert_eq!(
            common_content_key("a-b", "c%", None).unwrap().as_str(),
            "commonContent-a%2Db-c%25"
        );
        assert_eq!(
            site_content_key("my-friends", "eng00").unwrap().as_str(),
            "siteContent-my%2Dfriends-eng00"
        );
        // An escape sequence typed literally stays distinct from the escaped separator.
        assert_ne!(interface_key("a%2Db"), interface_key("a-b"));
    }

    proptest! {
        #[test]
        fn prop_lesson_key_is_deterministic(
            study in "[a-zA-Z]{1,8}",
            hl in "[a-z]{3}[0-9]{2}",
            jf in 1u32..100000,
            lesson in 1u32..500,
        ) {
            let a = lesson_content_key(&study, &hl, &jf.to_string(), &lesson.to_string());
            let b = lesson_content_key(&format!(" {} ", study), &hl, &format!("0{}", jf), &lesson.to_string());
            prop_assert!(a.is_some());
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_distinct_identities_give_distinct_keys(
            s1 in "[a-z%-]{1,6}", s2 in "[a-z%-]{1,6}",
            h1 in "[a-z0-9%-]{1,6}", h2 in "[a-z0-9%-]{1,6}",
            v1 in proptest::option::of("[a-z%-]{1,4}"),
            v2 in proptest::option::of("[a-z%-]{1,4}"),
            n1 in 1u32..50, n2 in 1u32..50,
        ) {
            let same_study = s1 == s2;
            let same_hl = h1 == h2;
            let same_n = n1 == n2;
            let same_variant = norm_variant(v1.as_deref()) == norm_variant(v2.as_deref());

            prop_assert_eq!(interface_key(&h1) == interface_key(&h2), same_hl);
            prop_assert_eq!(
                common_content_key(&s1, &h1, v1.as_deref()) == common_content_key(&s2, &h2, v2.as_deref()),
                same_study && same_hl && same_variant
            );
            prop_assert_eq!(
                lesson_content_key(&s1, &h1, "529", &n1.to_string())
                    == lesson_content_key(&s2, &h2, "529", &n2.to_string()),
                same_study && same_hl && same_n
            );
            prop_assert_eq!(site_content_key(&s1, &h1) == site_content_key(&s2, &h2), same_study && same_hl);
            prop_assert_eq!(
                notes_key(&s1, &n1.to_string(), None) == notes_key(&s2, &n2.to_string(), None),
                same_study && same_n
            );
            prop_assert_eq!(
                video_urls_key(&s1, &n1.to_string()) == video_urls_key(&s2, &n2.to_string()),
                same_study && same_n
            );
            prop_assert_eq!(study_progress_key(&s1) == study_progress_key(&s2), same_study);
        }

        #[test]
        fn prop_whitespace_only_is_no_key(ws in "[ \t\n]{0,5}") {
            prop_assert!(interface_key(&ws).is_none());
            prop_assert!(study_progress_key(&ws).is_none());
        }
    }
}
