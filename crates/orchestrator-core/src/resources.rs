//! Per-stage resource declarations
//!
//! Consumed by the execution backend when it schedules a stage. No workflow
//! operation branches on these values.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use common::types::Stage;

/// GPUs requested for Train when not overridden
pub const DEFAULT_TRAIN_GPUS: u32 = 1;

/// CPUs requested for Train
pub const TRAIN_CPUS: u32 = 16;

/// Memory requested for Train, in MB
pub const TRAIN_MEMORY_MB: u64 = 72_000;

/// Container image Train runs in
pub const TRAIN_IMAGE: &str = "valayob/hf-transformer-gpu:4.29.2.3";

/// Resources one stage asks the backend for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResources {
    /// Stage the declaration applies to
    pub stage: Stage,

    /// GPU count
    pub gpu: u32,

    /// CPU count (backend default when unset)
    pub cpu: Option<u32>,

    /// Memory in MB (backend default when unset)
    pub memory_mb: Option<u64>,

    /// Container image (backend default when unset)
    pub image: Option<String>,

    /// Environment injected into the stage
    pub env: BTreeMap<String, String>,
}

impl StageResources {
    /// Resource profile of `stage` with the default GPU count
    pub fn for_stage(stage: Stage) -> Self {
        Self::for_stage_with_gpus(stage, DEFAULT_TRAIN_GPUS)
    }

    /// Resource profile of `stage`; `gpus` only affects Train
    pub fn for_stage_with_gpus(stage: Stage, gpus: u32) -> Self {
        match stage {
            Stage::Train => {
                let visible_devices = (0..gpus)
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(",");

                let mut env = BTreeMap::new();
                env.insert("CUDA_VISIBLE_DEVICES".to_string(), visible_devices);
                env.insert("WORLD_SIZE".to_string(), gpus.to_string());

                Self {
                    stage,
                    gpu: gpus,
                    cpu: Some(TRAIN_CPUS),
                    memory_mb: Some(TRAIN_MEMORY_MB),
                    image: Some(TRAIN_IMAGE.to_string()),
                    env,
                }
            }
            Stage::Prepare | Stage::Publish => Self {
                stage,
                gpu: 0,
                cpu: None,
                memory_mb: None,
                image: None,
                env: BTreeMap::new(),
            },
        }
    }

    /// Profiles for every stage in execution order
    pub fn all(gpus: u32) -> Vec<Self> {
        Stage::ALL
            .iter()
            .map(|stage| Self::for_stage_with_gpus(*stage, gpus))
            .collect()
    }
}
