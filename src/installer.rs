//! Interface installer: the only path that mutates installed UI messages.

use crate::content::ContentRecord;
use crate::keys;
use crate::poller::InstallFn;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Top-level namespace never merged into messages.
const META_NAMESPACE: &str = "meta";

/// Offending paths listed in a single diagnostic.
const MAX_REPORTED_OFFENDERS: usize = 20;

/// Runtime message tables, one per locale.
pub trait MessageCatalog: Send + Sync {
    fn messages(&self, locale: &str) -> Option<Map<String, Value>>;
    fn set_messages(&self, locale: &str, tree: Map<String, Value>);
    fn set_active_locale(&self, locale: &str);
}

/// Document-level language attributes.
pub trait DocumentRoot: Send + Sync {
    fn set_lang(&self, lang: &str);
    fn set_dir(&self, dir: TextDirection);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextDirection {
    #[default]
    Ltr,
    Rtl,
}

impl TextDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextDirection::Ltr => "ltr",
            TextDirection::Rtl => "rtl",
        }
    }
}

impl fmt::Display for TextDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory message catalog.
#[derive(Default)]
pub struct MessageTable {
    tables: RwLock<HashMap<String, Map<String, Value>>>,
    active: RwLock<Option<String>>,
}

impl MessageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_locale(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessageCatalog for MessageTable {
    fn messages(&self, locale: &str) -> Option<Map<String, Value>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(locale)
            .cloned()
    }

    fn set_messages(&self, locale: &str, tree: Map<String, Value>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(locale.to_string(), tree);
    }

    fn set_active_locale(&self, locale: &str) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(locale.to_string());
    }
}

/// In-memory document root attributes.
#[derive(Default)]
pub struct DocumentAttributes {
    lang: RwLock<Option<String>>,
    dir: RwLock<Option<TextDirection>>,
}

impl DocumentAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lang(&self) -> Option<String> {
        self.lang.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn dir(&self) -> Option<TextDirection> {
        *self.dir.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentRoot for DocumentAttributes {
    fn set_lang(&self, lang: &str) {
        *self.lang.write().unwrap_or_else(PoisonError::into_inner) = Some(lang.to_string());
    }

    fn set_dir(&self, dir: TextDirection) {
        *self.dir.write().unwrap_or_else(PoisonError::into_inner) = Some(dir);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Validated entries merged (deletion markers included)
    pub applied: usize,
    /// Non-string leaves dropped during validation
    pub dropped: usize,
}

impl InstallOutcome {
    pub fn is_applied(&self) -> bool {
        self.applied > 0
    }
}

pub struct InterfaceInstaller {
    catalog: Arc<dyn MessageCatalog>,
    document: Arc<dyn DocumentRoot>,
    /// Serializes read-merge-write against the catalog.
    merge: Mutex<()>,
}

impl InterfaceInstaller {
    pub fn new(catalog: Arc<dyn MessageCatalog>, document: Arc<dyn DocumentRoot>) -> Self {
        Self {
            catalog,
            document,
            merge: Mutex::new(()),
        }
    }

    /// Merge an interface payload into the messages for `hl` and make
    /// `hl` the active locale.
    pub fn install(&self, hl: &str, payload: &ContentRecord) -> InstallOutcome {
        let Some(hl) = keys::norm_hl(hl) else {
            warn!("Interface install skipped: blank language code");
            return InstallOutcome::default();
        };
        let Some(root) = payload.as_object() else {
            warn!("Interface install skipped for {}: payload is not an object", hl);
            return InstallOutcome::default();
        };

        let mut offenders = Vec::new();
        let content = root
            .iter()
            .filter(|(k, _)| k.as_str() != META_NAMESPACE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Map<String, Value>>();
        let validated = validate_messages(&content, "", &mut offenders);

        if !offenders.is_empty() {
            let shown = offenders.len().min(MAX_REPORTED_OFFENDERS);
            warn!(
                "Non-string entries dropped for {} (showing up to {}): {:?}",
                hl,
                MAX_REPORTED_OFFENDERS,
                &offenders[..shown]
            );
            if offenders.len() > MAX_REPORTED_OFFENDERS {
                warn!("Total non-string entries dropped for {}: {}", hl, offenders.len());
            }
        }

        let outcome = InstallOutcome {
            applied: count_entries(&validated),
            dropped: offenders.len(),
        };
        if validated.is_empty() {
            warn!("No valid interface keys after validation for {}", hl);
            return outcome;
        }

        let meta = payload.meta();
        let lang = lang_from_meta(meta, &hl);
        let dir = direction_from_meta(meta);

        {
            let _merge = self.merge.lock().unwrap_or_else(PoisonError::into_inner);
            let mut messages = self.catalog.messages(&hl).unwrap_or_default();
            deep_merge_with_delete(&mut messages, validated);
            self.catalog.set_messages(&hl, messages);
            self.catalog.set_active_locale(&hl);
            self.document.set_lang(&lang);
            self.document.set_dir(dir);
        }

        debug!(
            "Installed {} interface entries for {} (lang={}, dir={})",
            outcome.applied, hl, lang, dir
        );
        outcome
    }

    /// The installer as a poll completion callback.
    pub fn install_fn(self: &Arc<Self>) -> InstallFn {
        let installer = Arc::clone(self);
        Arc::new(move |hl: &str, record: &ContentRecord| {
            installer.install(hl, record);
        })
    }
}

/// Keep string leaves and deletion markers; record the paths of
/// everything else. Nested objects left empty are dropped.
fn validate_messages(
    tree: &Map<String, Value>,
    prefix: &str,
    offenders: &mut Vec<String>,
) -> Map<String, Value> {
    let mut valid = Map::new();
    for (key, value) in tree {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(child) => {
                let child = validate_messages(child, &path, offenders);
                if !child.is_empty() {
                    valid.insert(key.clone(), Value::Object(child));
                }
            }
            Value::String(_) | Value::Null => {
                valid.insert(key.clone(), value.clone());
            }
            _ => offenders.push(path),
        }
    }
    valid
}

fn count_entries(tree: &Map<String, Value>) -> usize {
    tree.values()
        .map(|v| match v {
            Value::Object(child) => count_entries(child),
            _ => 1,
        })
        .sum()
}

/// Deep merge where a `null` or `""` in `patch` deletes the key from
/// `base`. Keys absent from `patch` are untouched.
pub fn deep_merge_with_delete(base: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                base.remove(&key);
            }
            Value::String(s) if s.is_empty() => {
                base.remove(&key);
            }
            Value::Object(child) => {
                let slot = base
                    .entry(key)
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(nested) = slot {
                    deep_merge_with_delete(nested, child);
                }
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

fn non_blank_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `lang` attribute: `meta.language.{html,google,code}`, then the same
/// fields on `meta`, then the HL code.
fn lang_from_meta(meta: Option<&Map<String, Value>>, hl: &str) -> String {
    let source = meta.map(|m| m.get("language").and_then(Value::as_object).unwrap_or(m));
    source
        .and_then(|m| {
            ["html", "google", "code"]
                .iter()
                .find_map(|field| non_blank_str(m, field))
        })
        .unwrap_or(hl)
        .to_string()
}

fn direction_from_meta(meta: Option<&Map<String, Value>>) -> TextDirection {
    let Some(meta) = meta else {
        return TextDirection::Ltr;
    };
    let declared = non_blank_str(meta, "dir").or_else(|| non_blank_str(meta, "textDirection"));
    match declared {
        Some(dir) if dir.eq_ignore_ascii_case("rtl") => TextDirection::Rtl,
        Some(_) => TextDirection::Ltr,
        None if meta.get("rtl") == Some(&Value::Bool(true)) => TextDirection::Rtl,
        None => TextDirection::Ltr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    fn setup() -> (Arc<InterfaceInstaller>, Arc<MessageTable>, Arc<DocumentAttributes>) {
        let catalog = Arc::new(MessageTable::new());
        let document = Arc::new(DocumentAttributes::new());
        let installer = Arc::new(InterfaceInstaller::new(catalog.clone(), document.clone()));
        (installer, catalog, document)
    }

    #[test]
    fn test_merge_deletion_law() {
        let mut base = obj(json!({"a": "y", "b": "z", "c": "w"}));
        deep_merge_with_delete(&mut base, obj(json!({"a": "x", "b": null})));
        assert_eq!(Value::Object(base), json!({"a": "x", "c": "w"}));
    }

    #[test]
    fn test_merge_nested_and_empty_string_delete() {
        let mut base = obj(json!({
            "menu": {"home": "Home", "about": "About"},
            "footer": "f"
        }));
        deep_merge_with_delete(
            &mut base,
            obj(json!({"menu": {"about": "", "contact": "Contact"}, "title": "T"})),
        );
        assert_eq!(
            Value::Object(base),
            json!({
                "menu": {"home": "Home", "contact": "Contact"},
                "footer": "f",
                "title": "T"
            })
        );
    }

    #[test]
    fn test_merge_object_replaces_scalar() {
        let mut base = obj(json!({"menu": "flat"}));
        deep_merge_with_delete(&mut base, obj(json!({"menu": {"home": "Home"}})));
        assert_eq!(Value::Object(base), json!({"menu": {"home": "Home"}}));
    }

    #[test]
    fn test_install_merges_and_activates_locale() {
        let (installer, catalog, document) = setup();
        catalog.set_messages("eng00", obj(json!({"a": "y", "b": "z", "c": "w"})));

        let outcome = installer.install(
            "eng00",
            &ContentRecord::new(json!({"a": "x", "b": null, "meta": {"complete": true}})),
        );

        assert_eq!(outcome, InstallOutcome { applied: 2, dropped: 0 });
        assert_eq!(
            Value::Object(catalog.messages("eng00").unwrap()),
            json!({"a": "x", "c": "w"})
        );
        assert_eq!(catalog.active_locale().as_deref(), Some("eng00"));
        assert_eq!(document.lang().as_deref(), Some("eng00"));
        assert_eq!(document.dir(), Some(TextDirection::Ltr));
    }

    #[test]
    fn test_meta_never_merged() {
        let (installer, catalog, _) = setup();
        installer.install(
            "eng00",
            &ContentRecord::new(json!({"hello": "Hello", "meta": {"cronKey": "k"}})),
        );
        let messages = catalog.messages("eng00").unwrap();
        assert!(!messages.contains_key("meta"));
        assert_eq!(messages.get("hello"), Some(&json!("Hello")));
    }

    #[test]
    fn test_non_string_leaves_dropped() {
        let (installer, catalog, _) = setup();
        let outcome = installer.install(
            "eng00",
            &ContentRecord::new(json!({
                "ok": "fine",
                "count": 3,
                "flags": [1, 2],
                "nested": {"deep": true, "label": "L"},
                "onlyBad": {"x": 1}
            })),
        );

        assert_eq!(outcome.dropped, 4);
        assert_eq!(outcome.applied, 2);
        assert_eq!(
            Value::Object(catalog.messages("eng00").unwrap()),
            json!({"ok": "fine", "nested": {"label": "L"}})
        );
    }

    #[test]
    fn test_many_offenders_are_counted() {
        let (installer, _, _) = setup();
        let mut payload = Map::new();
        for i in 0..25 {
            payload.insert(format!("k{}", i), json!(i));
        }
        payload.insert("good".to_string(), json!("yes"));

        let outcome = installer.install("eng00", &ContentRecord::new(Value::Object(payload)));
        assert_eq!(outcome, InstallOutcome { applied: 1, dropped: 25 });
    }

    #[test]
    fn test_empty_after_validation_mutates_nothing() {
        let (installer, catalog, document) = setup();
        catalog.set_messages("eng00", obj(json!({"keep": "me"})));

        let outcome = installer.install(
            "eng00",
            &ContentRecord::new(json!({"n": 1, "meta": {"complete": true}})),
        );

        assert!(!outcome.is_applied());
        assert_eq!(Value::Object(catalog.messages("eng00").unwrap()), json!({"keep": "me"}));
        assert_eq!(catalog.active_locale(), None);
        assert_eq!(document.lang(), None);
    }

    #[test]
    fn test_lang_from_meta_precedence() {
        let meta = obj(json!({"language": {"html": "fr-CA", "google": "fr", "code": "frn"}}));
        assert_eq!(lang_from_meta(Some(&meta), "frn00"), "fr-CA");

        let meta = obj(json!({"language": {"google": "fr"}}));
        assert_eq!(lang_from_meta(Some(&meta), "frn00"), "fr");

        let meta = obj(json!({"code": "es"}));
        assert_eq!(lang_from_meta(Some(&meta), "spn00"), "es");

        let meta = obj(json!({"complete": true}));
        assert_eq!(lang_from_meta(Some(&meta), "eng00"), "eng00");
        assert_eq!(lang_from_meta(None, "eng00"), "eng00");
    }

    #[test]
    fn test_direction_from_meta() {
        assert_eq!(direction_from_meta(None), TextDirection::Ltr);
        assert_eq!(
            direction_from_meta(Some(&obj(json!({"dir": "RTL"})))),
            TextDirection::Rtl
        );
        assert_eq!(
            direction_from_meta(Some(&obj(json!({"textDirection": "rtl"})))),
            TextDirection::Rtl
        );
        assert_eq!(
            direction_from_meta(Some(&obj(json!({"rtl": true})))),
            TextDirection::Rtl
        );
        assert_eq!(
            direction_from_meta(Some(&obj(json!({"dir": "sideways"})))),
            TextDirection::Ltr
        );
        assert_eq!(
            direction_from_meta(Some(&obj(json!({"rtl": "yes"})))),
            TextDirection::Ltr
        );
    }

    #[test]
    fn test_rtl_payload_sets_document_attributes() {
        let (installer, _, document) = setup();
        installer.install(
            "arb00",
            &ContentRecord::new(json!({
                "hello": "مرحبا",
                "meta": {"language": {"html": "ar"}, "dir": "rtl"}
            })),
        );
        assert_eq!(document.lang().as_deref(), Some("ar"));
        assert_eq!(document.dir(), Some(TextDirection::Rtl));
    }

    #[test]
    fn test_install_fn_routes_through_installer() {
        let (installer, catalog, _) = setup();
        let install = installer.install_fn();

        install("eng00", &ContentRecord::new(json!({"a": "b"})));

        assert_eq!(Value::Object(catalog.messages("eng00").unwrap()), json!({"a": "b"}));
    }

    #[test]
    fn test_blank_language_code_is_ignored() {
        let (installer, catalog, _) = setup();
        let outcome = installer.install("  ", &ContentRecord::new(json!({"a": "b"})));
        assert!(!outcome.is_applied());
        assert_eq!(catalog.active_locale(), None);
    }

    /// Catalog whose reads are slow enough for two installs to overlap.
    struct SlowCatalog {
        inner: MessageTable,
    }

    impl MessageCatalog for SlowCatalog {
        fn messages(&self, locale: &str) -> Option<Map<String, Value>> {
            let messages = self.inner.messages(locale);
            std::thread::sleep(std::time::Duration::from_millis(50));
            messages
        }

        fn set_messages(&self, locale: &str, tree: Map<String, Value>) {
            self.inner.set_messages(locale, tree);
        }

        fn set_active_locale(&self, locale: &str) {
            self.inner.set_active_locale(locale);
        }
    }

    #[test]
    fn test_concurrent_installs_keep_both_patches() {
        let catalog = Arc::new(SlowCatalog {
            inner: MessageTable::new(),
        });
        let installer = Arc::new(InterfaceInstaller::new(
            catalog.clone(),
            Arc::new(DocumentAttributes::new()),
        ));

        let workers: Vec<_> = [json!({"a": "1"}), json!({"b": "2"})]
            .into_iter()
            .map(|patch| {
                let installer = Arc::clone(&installer);
                std::thread::spawn(move || {
                    installer.install("eng00", &ContentRecord::new(patch));
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(
            Value::Object(catalog.inner.messages("eng00").unwrap()),
            json!({"a": "1", "b": "2"})
        );
    }
}
