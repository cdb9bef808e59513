use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::detect::backend::{ModelCapability, ObjectDetector, SequenceClassifier};
use crate::detect::backends::{StubClassifier, StubDetector};
#[cfg(feature = "backend-tract")]
use crate::detect::backends::{TractClassifier, TractDetector};
use crate::error::VigilError;
use crate::frame::{DEFAULT_CLASSIFIER_EDGE, DEFAULT_SEQUENCE_LENGTH};

/// Where to load each model capability from.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSettings {
    pub violence_model: Option<String>,
    pub weapon_model: Option<String>,
    pub sequence_len: usize,
    pub classifier_edge: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            violence_model: None,
            weapon_model: None,
            sequence_len: DEFAULT_SEQUENCE_LENGTH,
            classifier_edge: DEFAULT_CLASSIFIER_EDGE,
        }
    }
}

/// Capability objects constructed once and shared by every session.
///
/// A capability that failed to load is simply absent; its detection path is
/// disabled and the reason is kept for health reporting.
#[derive(Clone, Default)]
pub struct ModelSet {
    violence: Option<Arc<dyn SequenceClassifier>>,
    weapons: Option<Arc<dyn ObjectDetector>>,
    unavailable: Vec<(ModelCapability, String)>,
}

impl ModelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_violence(mut self, model: Arc<dyn SequenceClassifier>) -> Self {
        self.violence = Some(model);
        self
    }

    pub fn with_weapons(mut self, model: Arc<dyn ObjectDetector>) -> Self {
        self.weapons = Some(model);
        self
    }

    pub fn violence(&self) -> Option<&Arc<dyn SequenceClassifier>> {
        self.violence.as_ref()
    }

    pub fn weapons(&self) -> Option<&Arc<dyn ObjectDetector>> {
        self.weapons.as_ref()
    }

    /// Capabilities that failed to load, with the reason.
    pub fn unavailable(&self) -> &[(ModelCapability, String)] {
        &self.unavailable
    }

    pub fn is_available(&self, capability: ModelCapability) -> bool {
        match capability {
            ModelCapability::ViolenceClassifier => self.violence.is_some(),
            ModelCapability::WeaponDetector => self.weapons.is_some(),
        }
    }

    /// Load every configured capability. Never fails as a whole: a model
    /// that cannot be loaded is logged and left out.
    pub fn load(settings: &ModelSettings) -> Self {
        let mut set = Self::new();

        match settings.violence_model.as_deref() {
            Some(path) => match load_classifier(path, settings) {
                Ok(model) => {
                    log::info!("violence classifier loaded from {} ({})", path, model.name());
                    set.violence = Some(model);
                }
                Err(err) => set.mark_unavailable(ModelCapability::ViolenceClassifier, err),
            },
            None => set.mark_unavailable(
                ModelCapability::ViolenceClassifier,
                anyhow!("no model path configured"),
            ),
        }

        match settings.weapon_model.as_deref() {
            Some(path) => match load_detector(path) {
                Ok(model) => {
                    log::info!("weapon detector loaded from {} ({})", path, model.name());
                    set.weapons = Some(model);
                }
                Err(err) => set.mark_unavailable(ModelCapability::WeaponDetector, err),
            },
            None => set.mark_unavailable(
                ModelCapability::WeaponDetector,
                anyhow!("no model path configured"),
            ),
        }

        set
    }

    /// Run each loaded model's warm-up hook. Failures are logged only.
    pub fn warm_up(&self) {
        if let Some(model) = &self.violence {
            if let Err(err) = model.warm_up() {
                log::warn!("violence classifier warm-up failed: {:#}", err);
            }
        }
        if let Some(model) = &self.weapons {
            if let Err(err) = model.warm_up() {
                log::warn!("weapon detector warm-up failed: {:#}", err);
            }
        }
    }

    fn mark_unavailable(&mut self, model: ModelCapability, err: anyhow::Error) {
        let reason = format!("{err:#}");
        let err = VigilError::ModelUnavailable {
            model,
            reason: reason.clone(),
        };
        log::warn!("{}; continuing without it", err);
        self.unavailable.push((model, reason));
    }
}

fn stub_url(path: &str) -> Result<Option<Url>> {
    if !path.starts_with("stub://") {
        return Ok(None);
    }
    let url = Url::parse(path).with_context(|| format!("invalid stub model path '{}'", path))?;
    if url.host_str() == Some("unavailable") {
        return Err(anyhow!("stub model marked unavailable"));
    }
    Ok(Some(url))
}

fn load_classifier(path: &str, settings: &ModelSettings) -> Result<Arc<dyn SequenceClassifier>> {
    if let Some(url) = stub_url(path)? {
        let stub = StubClassifier::from_url(&url)?;
        return Ok(Arc::new(stub));
    }
    #[cfg(feature = "backend-tract")]
    {
        let model = TractClassifier::new(path, settings.sequence_len, settings.classifier_edge)?;
        Ok(Arc::new(model))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = settings;
        Err(anyhow!(
            "loading {} requires the backend-tract feature",
            path
        ))
    }
}

fn load_detector(path: &str) -> Result<Arc<dyn ObjectDetector>> {
    if let Some(url) = stub_url(path)? {
        let stub = StubDetector::from_url(&url)?;
        return Ok(Arc::new(stub));
    }
    #[cfg(feature = "backend-tract")]
    {
        Ok(Arc::new(TractDetector::new(path)?))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow!(
            "loading {} requires the backend-tract feature",
            path
        ))
    }
}
