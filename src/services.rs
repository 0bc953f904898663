//! Per-kind content services built on [`ContentResolver`].

use crate::api::encoded_path;
use crate::content::{ContentKind, ContentRecord};
use crate::db::require_key;
use crate::error::{ContentError, Result};
use crate::installer::InterfaceInstaller;
use crate::keys;
use crate::resolver::{ContentResolver, ResolveRequest};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// Language used when the requested interface language cannot be loaded.
pub const FALLBACK_HL: &str = "eng00";

fn required(value: Option<String>, field: &str) -> Result<String> {
    value.ok_or_else(|| ContentError::MissingIdentity(field.to_string()))
}

// ----------------- Interface -----------------

pub struct InterfaceService {
    resolver: Arc<ContentResolver>,
    installer: Arc<InterfaceInstaller>,
    fallback_hl: String,
}

impl InterfaceService {
    pub fn new(resolver: Arc<ContentResolver>, installer: Arc<InterfaceInstaller>) -> Self {
        Self {
            resolver,
            installer,
            fallback_hl: FALLBACK_HL.to_string(),
        }
    }

    pub fn with_fallback_hl(mut self, hl: &str) -> Self {
        self.fallback_hl = hl.trim().to_string();
        self
    }

    /// Load and install the interface messages for `hl`.
    ///
    /// Falls back once to the fallback language; `Ok(None)` when neither
    /// could be loaded.
    pub async fn load(&self, hl: &str) -> Result<Option<ContentRecord>> {
        let hl = required(keys::norm_hl(hl), "languageCodeHL")?;

        let err = match self.load_exact(&hl).await {
            Ok(record) => return Ok(Some(record)),
            Err(e) => e,
        };
        warn!("Interface load failed for {}: {}", hl, err);
        if hl == self.fallback_hl {
            return Ok(None);
        }

        info!("Falling back to interface language {}", self.fallback_hl);
        match self.load_exact(&self.fallback_hl).await {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Fallback interface load failed for {}: {}", self.fallback_hl, e);
                Ok(None)
            }
        }
    }

    async fn load_exact(&self, hl: &str) -> Result<ContentRecord> {
        let key = require_key(keys::interface_key(hl), "languageCodeHL")?;
        let path = encoded_path(&["v2", "translate", "text", "interface", hl])?;
        let request = ResolveRequest::new(ContentKind::Interface, key, hl, path)
            .with_install(self.installer.install_fn());

        let record = self.resolver.resolve(request).await?;
        self.installer.install(hl, &record);
        Ok(record)
    }
}

// ----------------- Common content -----------------

pub struct CommonContentService {
    resolver: Arc<ContentResolver>,
}

impl CommonContentService {
    pub fn new(resolver: Arc<ContentResolver>) -> Self {
        Self { resolver }
    }

    pub async fn load(&self, study: &str, hl: &str, variant: Option<&str>) -> Result<ContentRecord> {
        let key = require_key(keys::common_content_key(study, hl, variant), "study, languageCodeHL")?;
        let study = required(keys::norm_id(study), "study")?;
        let hl = required(keys::norm_hl(hl), "languageCodeHL")?;

        let path = encoded_path(&["v2", "translate", "text", "common", study.as_str(), hl.as_str()])?;
        self.resolver
            .resolve(ResolveRequest::new(ContentKind::CommonContent, key, &hl, path))
            .await
    }
}

// ----------------- Lesson content -----------------

pub struct LessonContentService {
    resolver: Arc<ContentResolver>,
}

impl LessonContentService {
    pub fn new(resolver: Arc<ContentResolver>) -> Self {
        Self { resolver }
    }

    pub async fn load(&self, study: &str, hl: &str, jf: &str, lesson: &str) -> Result<ContentRecord> {
        let fields = "study, languageCodeHL, languageCodeJF, lesson";
        let key = require_key(keys::lesson_content_key(study, hl, jf, lesson), fields)?;
        let study = required(keys::norm_id(study), "study")?;
        let hl = required(keys::norm_hl(hl), "languageCodeHL")?;
        let jf = required(keys::norm_int(jf), "languageCodeJF")?;
        let lesson = required(keys::norm_int(lesson), "lesson")?;

        let path = format!(
            "{}?jf={}",
            encoded_path(&["v2", "translate", "lessonContent", hl.as_str(), study.as_str(), lesson.as_str()])?,
            jf
        );
        self.resolver
            .resolve(ResolveRequest::new(ContentKind::LessonContent, key, &hl, path))
            .await
    }
}

// ----------------- Site content -----------------

/// Site content with each section's `para` map flattened to `paras`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteContent {
    pub meta: Map<String, Value>,
    pub sections: Map<String, Value>,
}

pub struct SiteContentService {
    resolver: Arc<ContentResolver>,
    site: String,
}

impl SiteContentService {
    pub fn new(resolver: Arc<ContentResolver>, site: &str) -> Self {
        Self {
            resolver,
            site: site.to_string(),
        }
    }

    pub async fn load(&self, hl: &str) -> Result<ContentRecord> {
        let key = require_key(keys::site_content_key(&self.site, hl), "site, languageCodeHL")?;
        let site = required(keys::norm_id(&self.site), "site")?;
        let hl = required(keys::norm_hl(hl), "languageCodeHL")?;

        let path = encoded_path(&["v2", "translate", "text", "siteContent", site.as_str(), hl.as_str()])?;
        self.resolver
            .resolve(ResolveRequest::new(ContentKind::SiteContent, key, &hl, path))
            .await
    }

    pub async fn load_normalized(&self, hl: &str) -> Result<SiteContent> {
        let record = self.load(hl).await?;
        normalize_site_content(&record)
            .ok_or_else(|| ContentError::EmptyPayload(format!("siteContent for {}", hl)))
    }
}

pub fn normalize_site_content(record: &ContentRecord) -> Option<SiteContent> {
    let root = record.as_object()?;

    let meta = root
        .get("meta")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let sections = root
        .iter()
        .filter(|(key, _)| key.as_str() != "meta")
        .filter_map(|(key, value)| {
            value
                .as_object()
                .map(|section| (key.clone(), Value::Object(normalize_section(section))))
        })
        .collect();

    Some(SiteContent { meta, sections })
}

fn normalize_section(section: &Map<String, Value>) -> Map<String, Value> {
    if section.get("paras").is_some_and(Value::is_array) {
        return section.clone();
    }

    let mut out = section.clone();
    let paras = match out.remove("para") {
        Some(Value::Object(para)) => {
            let mut entries: Vec<(&String, &Value)> = para.iter().collect();
            entries.sort_by(|(a, _), (b, _)| compare_numeric(a, b));
            entries
                .into_iter()
                .filter_map(|(_, text)| text.as_str())
                .filter(|text| !text.trim().is_empty())
                .map(|text| Value::String(text.to_string()))
                .collect()
        }
        Some(other) => {
            out.insert("para".to_string(), other);
            Vec::new()
        }
        None => Vec::new(),
    };
    out.insert("paras".to_string(), Value::Array(paras));
    out
}

/// Numeric keys in numeric order, then everything else lexically.
fn compare_numeric(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
