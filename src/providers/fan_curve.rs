use anyhow::{Result, bail};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    config::FanCurveCfg,
    drivers::i2c_ec::controller::{FanMode, RegisterWrite},
    effects::{EffectSequence, EffectsEngine},
    error::EcError,
    fan_curve::{FanCurve, step_toward},
    providers::traits::ServiceProvider,
    sensors::TemperatureFeed,
    task_manager::TaskManager,
};

/// Manual fan control following a temperature curve.
///
/// Takes the fans out of EC control for as long as it runs and hands them
/// back in automatic mode when cancelled.
pub struct FanCurveServiceProvider {
    state: Arc<AppState>,
    cfg: FanCurveCfg,
}

impl FanCurveServiceProvider {
    pub fn new(state: Arc<AppState>, cfg: FanCurveCfg) -> Self {
        Self { state, cfg }
    }
}

#[async_trait]
impl ServiceProvider for FanCurveServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let curve = FanCurve::try_from(&self.cfg.curve)?;
        let model = self.state.model;
        let fans = match &self.cfg.fans {
            Some(fans) => fans.clone(),
            None => (0..model.fan_count()).collect(),
        };
        if let Some(fan) = fans.iter().find(|&&fan| model.fan(fan).is_none()) {
            bail!("Fan curve names fan {fan}, {} has {}", model.name, model.fan_count());
        }

        let period = Duration::from_millis(self.cfg.interval_ms).max(model.timing.min_write_interval);
        let effects = self.state.effects.clone();
        let feed = TemperatureFeed::Latest(self.state.latest_sample.clone());

        task_manager
            .spawn_task(self.name().to_string(), move |cancel_token| {
                run_fan_curve(effects, feed, curve, fans, period, cancel_token)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "FanCurveService"
    }

    fn priority(&self) -> i32 {
        4
    }
}

/// Writes needed to move `fans` toward the curve target at `celsius`.
///
/// Each fan moves at most `max_step` from its current speed. Fans already at
/// their next speed produce no write.
pub fn next_speeds(
    curve: &FanCurve,
    celsius: f32,
    fans: &[u8],
    current: &HashMap<u8, u8>,
    max_step: u8,
) -> Vec<(u8, u8)> {
    let target = curve.compute_speed(celsius);
    fans.iter()
        .filter_map(|&fan| {
            let next = match current.get(&fan) {
                Some(&speed) => step_toward(speed, target, max_step),
                None => target,
            };
            (current.get(&fan) != Some(&next)).then_some((fan, next))
        })
        .collect()
}

pub async fn run_fan_curve(
    effects: EffectsEngine,
    feed: TemperatureFeed,
    curve: FanCurve,
    fans: Vec<u8>,
    period: Duration,
    cancel_token: CancellationToken,
) -> Result<()> {
    effects
        .apply_effect(EffectSequence::fan_mode(FanMode::Manual))
        .await?;
    info!("Fan curve active on fans {fans:?}, updating every {period:?}");

    let max_step = effects.limits().max_fan_step;
    let mut current: HashMap<u8, u8> = HashMap::new();
    // The EC may drop manual mode while the host sleeps.
    let mut reclaim = false;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _instant = ticker.tick() => {
                if effects.is_held() {
                    reclaim = true;
                    continue;
                }
                let Some(celsius) = feed.current().await else {
                    continue;
                };
                if reclaim {
                    match effects.apply_effect(EffectSequence::fan_mode(FanMode::Manual)).await {
                        Ok(()) => reclaim = false,
                        Err(EcError::Suspended) => continue,
                        Err(e) => {
                            warn!("Failed to take fan control back after resume: {e}");
                            continue;
                        }
                    }
                }

                let writes = next_speeds(&curve, celsius, &fans, &current, max_step);
                if writes.is_empty() {
                    continue;
                }

                let seq = writes.iter().fold(EffectSequence::new("fan-curve"), |seq, &(fan, speed)| {
                    seq.then(RegisterWrite::FanSpeed { fan, speed }, Duration::ZERO)
                });
                match effects.apply_effect(seq).await {
                    Ok(()) => current.extend(writes),
                    Err(EcError::Suspended) => {
                        debug!("Fan curve held while the EC is suspended");
                        reclaim = true;
                    }
                    Err(e) => warn!("Fan curve update failed: {e}"),
                }
            }
        }
    }

    info!("Returning fans to automatic control");
    match effects
        .apply_effect(EffectSequence::fan_mode(FanMode::Auto))
        .await
    {
        Err(EcError::Suspended) => {
            warn!("EC is suspended, fans stay with the EC's own sleep policy");
            Ok(())
        }
        result => result.map_err(Into::into),
    }
}
