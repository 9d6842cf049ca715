//! Graph model contract
//!
//! The neural decoder is an opaque collaborator: it accepts a set of named
//! tensors and returns one tensor. Loading is asynchronous and reports
//! progress; [`ModelHandle`] makes sure concurrent callers share one load.

use crate::error::{NvcError, Result};
use crate::tensor::{Tensor, TensorRegistry};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Input name bound to the frame token
pub const TOKEN_INPUT: &str = "args_0:0";

/// Second input name bound to the same frame token
pub const TOKEN_INPUT_ALT: &str = "args_0_1:0";

/// Number of reference feature inputs the decoder takes
pub const FEATURE_INPUT_COUNT: usize = 4;

/// Input name of the `index`-th reference feature (`args_0_2:0` ..)
pub fn feature_input_name(index: usize) -> String {
    format!("args_0_{}:0", index + 2)
}

/// All input names of the decoder signature, in binding order
pub fn decoder_input_names() -> Vec<String> {
    let mut names = vec![TOKEN_INPUT.to_string(), TOKEN_INPUT_ALT.to_string()];
    names.extend((0..FEATURE_INPUT_COUNT).map(feature_input_name));
    names
}

/// Named tensors bound for one model execution
#[derive(Debug, Default)]
pub struct ModelInputs<'a> {
    bound: BTreeMap<String, &'a Tensor>,
}

impl<'a> ModelInputs<'a> {
    /// Create an empty binding set
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a tensor to an input name, replacing an earlier binding
    pub fn insert(&mut self, name: impl Into<String>, tensor: &'a Tensor) {
        self.bound.insert(name.into(), tensor);
    }

    /// Look up a bound tensor
    pub fn get(&self, name: &str) -> Option<&'a Tensor> {
        self.bound.get(name).copied()
    }

    /// Bound input names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bound.keys().map(String::as_str)
    }

    /// Iterate over bindings
    pub fn iter(&self) -> impl Iterator<Item = (&str, &'a Tensor)> {
        self.bound.iter().map(|(name, tensor)| (name.as_str(), *tensor))
    }

    /// Number of bound inputs
    pub fn len(&self) -> usize {
        self.bound.len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}

/// A loaded graph model
pub trait GraphModel: Send + Sync + Debug {
    /// Input names of the model signature
    fn input_names(&self) -> Vec<String>;

    /// Run the model once
    ///
    /// Implementations may accept a subset of [`GraphModel::input_names`] and
    /// must allocate their output through `registry`.
    fn execute(&self, inputs: &ModelInputs<'_>, registry: &TensorRegistry) -> Result<Tensor>;
}

/// Check that `inputs` binds exactly the model's signature
pub fn validate_inputs(model: &dyn GraphModel, inputs: &ModelInputs<'_>) -> Result<()> {
    let expected = model.input_names();
    let missing: Vec<String> = expected
        .iter()
        .filter(|name| inputs.get(name).is_none())
        .cloned()
        .collect();
    let unexpected: Vec<String> = inputs
        .names()
        .filter(|name| !expected.iter().any(|e| e == name))
        .map(str::to_string)
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(NvcError::ModelInputMismatch {
            missing,
            unexpected,
        })
    }
}

/// Progress callback receiving a percentage in `0..=100`
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Asynchronous model source
#[async_trait]
pub trait ModelLoader: Send + Sync + Debug {
    /// Load the model at `path`, reporting progress as it goes
    async fn load(&self, path: &str, progress: ProgressFn<'_>) -> Result<Arc<dyn GraphModel>>;
}

/// Loader that hands out an already constructed model
#[derive(Debug, Clone)]
pub struct StaticModelLoader {
    model: Arc<dyn GraphModel>,
}

impl StaticModelLoader {
    /// Wrap a constructed model
    pub fn new(model: Arc<dyn GraphModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ModelLoader for StaticModelLoader {
    async fn load(&self, _path: &str, progress: ProgressFn<'_>) -> Result<Arc<dyn GraphModel>> {
        progress(100);
        Ok(self.model.clone())
    }
}

/// Lazily loaded, shared model
#[derive(Debug)]
pub struct ModelHandle {
    path: String,
    loader: Arc<dyn ModelLoader>,
    model: Mutex<Option<Arc<dyn GraphModel>>>,
}

impl ModelHandle {
    /// Create a handle that loads `path` on first use
    pub fn new(path: impl Into<String>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            path: path.into(),
            loader,
            model: Mutex::new(None),
        }
    }

    /// Model location
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Return the loaded model, loading it first if needed
    ///
    /// Concurrent callers wait on the same load. A failed load leaves the
    /// handle empty so a later call can try again.
    pub async fn ensure(&self, progress: ProgressFn<'_>) -> Result<Arc<dyn GraphModel>> {
        let mut slot = self.model.lock().await;
        if let Some(model) = slot.as_ref() {
            debug!("Model already loaded from {}", self.path);
            return Ok(model.clone());
        }

        info!("Loading model from {}", self.path);
        progress(0);
        match self.loader.load(&self.path, progress).await {
            Ok(model) => {
                progress(100);
                info!(
                    inputs = model.input_names().len(),
                    "Model loaded from {}", self.path
                );
                *slot = Some(model.clone());
                Ok(model)
            }
            Err(e) => {
                warn!("Model load from {} failed: {}", self.path, e);
                Err(e)
            }
        }
    }

    /// The loaded model, if any
    pub async fn current(&self) -> Option<Arc<dyn GraphModel>> {
        self.model.lock().await.clone()
    }

    /// Whether a model is loaded
    pub async fn is_loaded(&self) -> bool {
        self.model.lock().await.is_some()
    }

    /// Drop the loaded model
    pub async fn unload(&self) {
        if self.model.lock().await.take().is_some() {
            info!("Model unloaded");
        }
    }
}
