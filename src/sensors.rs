use std::{sync::Arc, time::Instant};

use anyhow::Result;
use async_trait::async_trait;
use log::warn;
use tokio::sync::RwLock;

/// One temperature reading in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSample {
    pub celsius: f32,
    pub taken_at: Instant,
}

impl TemperatureSample {
    pub fn now(celsius: f32) -> Self {
        Self {
            celsius,
            taken_at: Instant::now(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    async fn sample(&self) -> Result<TemperatureSample>;

    fn name(&self) -> String;
}

/// Where a consumer gets its temperature from.
#[derive(Clone)]
pub enum TemperatureFeed {
    /// Whatever the reporting loop sampled last.
    Latest(Arc<RwLock<Option<TemperatureSample>>>),
    /// Sample on demand, when no reporting loop runs.
    Direct(Arc<dyn TemperatureSensor>),
}

impl TemperatureFeed {
    pub async fn current(&self) -> Option<f32> {
        match self {
            TemperatureFeed::Latest(latest) => latest.read().await.map(|s| s.celsius),
            TemperatureFeed::Direct(sensor) => match sensor.sample().await {
                Ok(sample) => Some(sample.celsius),
                Err(e) => {
                    warn!("Temperature sample failed: {e:#}");
                    None
                }
            },
        }
    }
}
