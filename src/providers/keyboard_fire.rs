use anyhow::{Result, bail};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    config::KeyboardFireCfg,
    drivers::i2c_ec::controller::Rgb,
    effects::{EffectSequence, EffectsEngine, fire_backlight},
    error::EcError,
    providers::traits::ServiceProvider,
    sensors::TemperatureFeed,
    task_manager::TaskManager,
};

/// Keyboard backlight that glows with the SoC temperature.
pub struct KeyboardFireServiceProvider {
    state: Arc<AppState>,
    cfg: KeyboardFireCfg,
}

impl KeyboardFireServiceProvider {
    pub fn new(state: Arc<AppState>, cfg: KeyboardFireCfg) -> Self {
        Self { state, cfg }
    }
}

#[async_trait]
impl ServiceProvider for KeyboardFireServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let model = self.state.model;
        if model.registers.keyboard_backlight.is_none() {
            bail!("{} has no keyboard backlight", model.name);
        }

        let effects = self.state.effects.clone();
        let feed = TemperatureFeed::Latest(self.state.latest_sample.clone());
        let cfg = self.cfg.clone();
        let period = fire_period(&cfg, model.timing.min_write_interval);

        task_manager
            .spawn_task(self.name().to_string(), move |cancel_token| {
                run_keyboard_fire(effects, feed, cfg, period, cancel_token)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "KeyboardFireService"
    }

    fn priority(&self) -> i32 {
        2
    }
}

/// Update period, never faster than the register may be written.
pub fn fire_period(cfg: &KeyboardFireCfg, min_write_interval: Duration) -> Duration {
    Duration::from_millis(cfg.period_ms).max(min_write_interval)
}

/// Recolours the keyboard whenever the temperature moves the colour.
pub async fn run_keyboard_fire(
    effects: EffectsEngine,
    feed: TemperatureFeed,
    cfg: KeyboardFireCfg,
    period: Duration,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Keyboard fire effect running every {period:?}");
    let mut shown: Option<Rgb> = None;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _instant = ticker.tick() => {
                if effects.is_held() {
                    // Redraw after resume, the EC may have reset the backlight.
                    shown = None;
                    continue;
                }
                let Some(celsius) = feed.current().await else {
                    continue;
                };
                let backlight = fire_backlight(celsius, &cfg);
                if shown == Some(backlight.color) {
                    continue;
                }

                match effects.apply_effect(EffectSequence::keyboard_backlight(backlight)).await {
                    Ok(()) => {
                        debug!("Keyboard at {celsius:.1}°C -> {}", backlight.color);
                        shown = Some(backlight.color);
                    }
                    Err(EcError::Suspended) => shown = None,
                    Err(e) => warn!("Keyboard fire update failed: {e}"),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app_context::test_state, config::Config, drivers::i2c_ec::fake::FakeEc,
        sensors::TemperatureSample,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn period_respects_write_interval() {
        let cfg = KeyboardFireCfg::default();
        assert_eq!(
            fire_period(&cfg, Duration::from_millis(500)),
            Duration::from_millis(500)
        );
        let slow = KeyboardFireCfg {
            period_ms: 2000,
            ..cfg
        };
        assert_eq!(
            fire_period(&slow, Duration::from_millis(500)),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn unchanged_colour_is_not_rewritten() {
        let fake = FakeEc::new();
        let state = test_state(Config::default(), &fake);
        *state.latest_sample.write().await = Some(TemperatureSample::now(55.0));

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_keyboard_fire(
            state.effects.clone(),
            TemperatureFeed::Latest(state.latest_sample.clone()),
            KeyboardFireCfg::default(),
            Duration::from_millis(50),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let frames = fake.aux_frames(0x51);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0[7..11], [1, 128, 32, 0]);
    }

    #[tokio::test]
    async fn fire_pauses_while_suspended_and_redraws_after() {
        let fake = FakeEc::new();
        let state = test_state(Config::default(), &fake);
        *state.latest_sample.write().await = Some(TemperatureSample::now(55.0));
        state.session.set_suspended(true);

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_keyboard_fire(
            state.effects.clone(),
            TemperatureFeed::Latest(state.latest_sample.clone()),
            KeyboardFireCfg::default(),
            Duration::from_millis(50),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fake.transfer_count(), 0);

        state.session.set_suspended(false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(fake.aux_frames(0x51).len(), 1);
    }
}
