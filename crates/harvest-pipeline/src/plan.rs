//! Execution plan resolved once from configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::blob::StoreFormat;
use crate::config::{DecodePolicy, FetchPolicy, PipelineConfig};
use crate::error::ConfigError;
use crate::record::RecordSchema;
use crate::thumbnail::ThumbnailSpec;
use crate::validation::Validator;

/// Pipeline stages, in their only valid relative order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    FetchAssets,
    Thumbnails,
    Validate,
    Write,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::FetchAssets,
        StageKind::Thumbnails,
        StageKind::Validate,
        StageKind::Write,
    ];

    /// Configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::FetchAssets => "fetch_assets",
            StageKind::Thumbnails => "thumbnails",
            StageKind::Validate => "validate",
            StageKind::Write => "write",
        }
    }

    /// Record state while the stage runs
    pub fn state_name(self) -> &'static str {
        match self {
            StageKind::FetchAssets => "Fetching",
            StageKind::Thumbnails => "Thumbnailing",
            StageKind::Validate => "Validating",
            StageKind::Write => "Writing",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// Validated, ordered stage list plus everything a record traversal needs
#[derive(Debug)]
pub struct ExecutionPlan {
    stages: Vec<StageKind>,
    first: StageKind,
    pub schema: RecordSchema,
    pub thumbnails: Vec<ThumbnailSpec>,
    pub validator: Validator,
    pub store_format: StoreFormat,
    pub fetch_policy: FetchPolicy,
    pub decode_policy: DecodePolicy,
    pub record_timeout: Option<Duration>,
}

impl ExecutionPlan {
    /// Resolve configuration into a plan, rejecting invalid stage lists
    pub fn resolve(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let stages = resolve_stages(&config.stages)?;
        let first = *stages
            .first()
            .ok_or_else(|| ConfigError::Invalid("stages must enable at least one stage".to_string()))?;

        let fetch_enabled = stages.contains(&StageKind::FetchAssets);
        let schema = RecordSchema {
            identity_fields: config.identity_fields.clone(),
            asset_fields: if fetch_enabled {
                config.asset_fields.clone()
            } else {
                Vec::new()
            },
        };

        let thumbnails = if stages.contains(&StageKind::Thumbnails) {
            validate_thumbnails(&config.images.thumbnails)?;
            config.images.thumbnails.clone()
        } else {
            Vec::new()
        };

        let validator = Validator::compile(&config.mandatory_fields, &config.validation.rules)?;

        Ok(Self {
            stages,
            first,
            schema,
            thumbnails,
            validator,
            store_format: config.images.store_format,
            fetch_policy: config.policy.fetch,
            decode_policy: config.policy.decode,
            record_timeout: config.record_timeout(),
        })
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    pub fn is_enabled(&self, stage: StageKind) -> bool {
        self.stages.contains(&stage)
    }

    /// First enabled stage, reported for records cancelled before admission
    pub fn first_stage(&self) -> StageKind {
        self.first
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<&str> = self.stages.iter().map(|s| s.as_str()).collect();
        writeln!(f, "stages: {}", stages.join(" -> "))?;
        writeln!(f, "identity fields: {}", self.schema.identity_fields.join(", "))?;
        writeln!(f, "asset fields: {}", self.schema.asset_fields.join(", "))?;
        for spec in &self.thumbnails {
            writeln!(f, "thumbnail {}: {}x{}", spec.name, spec.width, spec.height)?;
        }
        for rule in self.validator.rules() {
            writeln!(f, "rule {} ({})", rule.name(), rule.severity())?;
        }
        writeln!(f, "store format: {}", self.store_format)?;
        writeln!(f, "fetch policy: {:?}", self.fetch_policy)?;
        writeln!(f, "decode policy: {:?}", self.decode_policy)?;
        match self.record_timeout {
            Some(timeout) => write!(f, "record timeout: {}s", timeout.as_secs()),
            None => write!(f, "record timeout: none"),
        }
    }
}

fn resolve_stages(names: &[String]) -> Result<Vec<StageKind>, ConfigError> {
    let mut stages: Vec<StageKind> = Vec::with_capacity(names.len());

    for name in names {
        let stage: StageKind = name.parse()?;
        if stages.contains(&stage) {
            return Err(ConfigError::DuplicateStage(stage));
        }
        if let Some(&last) = stages.last() {
            if stage < last {
                return Err(ConfigError::OutOfOrder { stage, after: last });
            }
        }
        stages.push(stage);
    }

    let requires = [
        (StageKind::Thumbnails, StageKind::FetchAssets),
        (StageKind::Write, StageKind::Validate),
    ];
    for (stage, required) in requires {
        if stages.contains(&stage) && !stages.contains(&required) {
            return Err(ConfigError::MissingDependency {
                stage,
                requires: required,
            });
        }
    }

    Ok(stages)
}

fn validate_thumbnails(specs: &[ThumbnailSpec]) -> Result<(), ConfigError> {
    for (index, spec) in specs.iter().enumerate() {
        if spec.name.is_empty()
            || !spec
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidThumbnail {
                name: spec.name.clone(),
                message: "name must be non-empty and use only [A-Za-z0-9_-]".to_string(),
            });
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(ConfigError::InvalidThumbnail {
                name: spec.name.clone(),
                message: "width and height must be greater than 0".to_string(),
            });
        }
        if specs[..index].iter().any(|other| other.name == spec.name) {
            return Err(ConfigError::InvalidThumbnail {
                name: spec.name.clone(),
                message: "declared more than once".to_string(),
            });
        }
    }
    Ok(())
}
