use crate::error::{Error, Result};
use crate::types::{Field, FieldSet, UserOperationDraft};
use async_trait::async_trait;
use std::fmt;

/// One step of UserOperation assembly.
///
/// A stage declares which fields it reads and which it fills in. [`Pipeline::new`] checks the
/// declarations against each other, so a misordered pipeline fails at composition time
/// instead of producing an operation the bundler rejects.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fields that must be resolved before the stage runs.
    fn requires(&self) -> FieldSet;

    /// Fields the stage resolves.
    fn provides(&self) -> FieldSet;

    async fn apply(&self, draft: UserOperationDraft) -> Result<UserOperationDraft>;
}

/// An ordered, contract-checked list of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    initial: FieldSet,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline")
            .field("stages", &names)
            .field("initial", &self.initial)
            .finish()
    }
}

impl Pipeline {
    /// Composes `stages` to run on drafts that already have `initial` resolved.
    ///
    /// Fails when a stage needs a field no earlier stage provides, or when any stage is
    /// placed after the one producing the signature.
    pub fn new(initial: FieldSet, stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        let mut resolved = initial;
        let mut signed_by: Option<&'static str> = None;

        for stage in &stages {
            if let Some(signer) = signed_by {
                return Err(Error::Config(format!(
                    "stage `{}` is placed after `{signer}`; nothing may change a signed operation",
                    stage.name()
                )));
            }
            let missing = stage.requires().difference(resolved);
            if !missing.is_empty() {
                return Err(Error::Config(format!(
                    "stage `{}` requires {missing} which no earlier stage provides",
                    stage.name()
                )));
            }
            resolved = resolved.union(stage.provides());
            if stage.provides().contains(Field::Signature) {
                signed_by = Some(stage.name());
            }
        }

        Ok(Self { stages, initial })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage in order. The first failure aborts the run and the partial draft is
    /// dropped, along with any nonce reservation it holds.
    pub async fn run(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let missing = self.initial.difference(draft.resolved());
        if !missing.is_empty() {
            return Err(Error::StageContract {
                stage: "pipeline input",
                missing,
            });
        }

        let mut draft = draft;
        for stage in &self.stages {
            let missing = stage.requires().difference(draft.resolved());
            if !missing.is_empty() {
                return Err(Error::StageContract {
                    stage: stage.name(),
                    missing,
                });
            }

            tracing::debug!(stage = stage.name(), "running stage");
            draft = stage.apply(draft).await.map_err(|error| {
                tracing::warn!(stage = stage.name(), %error, "stage failed");
                error
            })?;

            let missing = stage.provides().difference(draft.resolved());
            if !missing.is_empty() {
                return Err(Error::StageContract {
                    stage: stage.name(),
                    missing,
                });
            }
        }
        Ok(draft)
    }
}
