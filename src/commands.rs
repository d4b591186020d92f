//! One-shot subcommands: `models`, `status` and `effect`.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::{effect_limits, open_session},
    cli::EffectCommand,
    config::Config,
    drivers::i2c_ec::controller::{Backlight, FanMode},
    effects::{EffectLimits, EffectSequence, EffectsEngine, fire_backlight},
    models::{MODELS, Model},
    providers::keyboard_fire::{fire_period, run_keyboard_fire},
    sensors::{TemperatureFeed, TemperatureSensor},
    temperature_sensors::ThermalZoneSource,
};

pub fn models(json: bool) -> Result<()> {
    if json {
        let summaries: Vec<_> = MODELS.iter().map(Model::summary).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    for model in MODELS {
        println!("{}", model.name);
        for (index, fan) in model.fans.iter().enumerate() {
            println!("  fan {index}: {} ({} blades)", fan.name, fan.blades);
        }
        println!("  profiles: {}", model.profiles.join(", "));
        if model.registers.keyboard_backlight.is_some() {
            println!("  keyboard backlight");
        }
    }
    Ok(())
}

pub async fn status(config: &Config) -> Result<()> {
    let session = open_session(config)?;
    let model = session.model();

    let raw_mode = session
        .run(|ctrl| ctrl.fan_mode())
        .await
        .context("Failed to read the fan mode")?;
    let regs = &model.registers;
    let mode = if raw_mode == regs.fan_mode_auto {
        FanMode::Auto.to_string()
    } else if raw_mode == regs.fan_mode_manual {
        FanMode::Manual.to_string()
    } else {
        format!("mode {raw_mode}")
    };
    println!("{}: fans {mode}", model.name);

    for (index, fan) in (0..model.fan_count()).zip(model.fans) {
        let rpm = session
            .fan_rpm(index)
            .await
            .with_context(|| format!("Failed to read {}", fan.name))?;
        println!(
            "  {}: {rpm} RPM ({:.1} Hz)",
            fan.name,
            fan.hz_for_rpm(u32::from(rpm))
        );
    }

    match thermal_sensor(config)?.sample().await {
        Ok(sample) => println!("  temperature: {:.1}°C", sample.celsius),
        Err(e) => println!("  temperature: unavailable ({e:#})"),
    }
    Ok(())
}

pub async fn effect(config: &Config, command: EffectCommand) -> Result<()> {
    let session = open_session(config)?;
    let model = session.model();
    let engine = EffectsEngine::new(session, effect_limits(config, model));

    match command {
        EffectCommand::Fire { follow: true } => {
            follow_fire(config, engine, model.timing.min_write_interval).await
        }
        EffectCommand::Fire { follow: false } => {
            let celsius = thermal_sensor(config)?.sample().await?.celsius;
            let cfg = config.keyboard_fire.clone().unwrap_or_default();
            let backlight = fire_backlight(celsius, &cfg);
            engine
                .apply_effect(EffectSequence::keyboard_backlight(backlight))
                .await?;
            println!("{celsius:.1}°C -> {}", backlight.color);
            Ok(())
        }
        command => {
            let seq = build_sequence(&command, model, engine.limits())?;
            info!("Applying effect '{}'", seq.name());
            engine.apply_effect(seq).await?;
            Ok(())
        }
    }
}

/// Translates a fixed effect into its register writes.
pub fn build_sequence(
    command: &EffectCommand,
    model: &Model,
    limits: EffectLimits,
) -> Result<EffectSequence> {
    let seq = match *command {
        EffectCommand::FanMode { mode } => EffectSequence::fan_mode(mode),
        EffectCommand::FanSpeed { value, rpm, fan } => {
            let speed = if rpm {
                let Some(rpm_model) = model.fan(fan).and_then(|f| f.rpm_model) else {
                    bail!("No RPM model for fan {fan} of {}", model.name);
                };
                rpm_model.speed_for_rpm(value).ok_or_else(|| {
                    anyhow!("RPM fit for fan {fan} of {} has no rising branch", model.name)
                })?
            } else {
                u8::try_from(value).with_context(|| format!("Speed {value} is not in 0-255"))?
            };
            EffectSequence::fan_speed(fan, speed)
        }
        EffectCommand::Ramp {
            from,
            to,
            fan,
            step,
            hold_ms,
        } => {
            let hold = Duration::from_millis(hold_ms).max(model.timing.min_write_interval);
            let step = step.unwrap_or(limits.max_fan_step);
            if step == 0 {
                bail!("Ramp step must be positive");
            }
            EffectSequence::fan_ramp(fan, from, to, step, hold)
        }
        EffectCommand::Profile { index } => EffectSequence::profile(index),
        EffectCommand::Keyboard {
            color,
            mode,
            period,
        } => EffectSequence::keyboard_backlight(Backlight {
            mode,
            color,
            period,
        }),
        EffectCommand::SuspendMode { state } => EffectSequence::suspend_mode(state.into()),
        EffectCommand::Fire { .. } => bail!("The fire effect follows the temperature"),
    };
    Ok(seq)
}

async fn follow_fire(
    config: &Config,
    engine: EffectsEngine,
    min_write_interval: Duration,
) -> Result<()> {
    let cfg = config.keyboard_fire.clone().unwrap_or_default();
    let period = fire_period(&cfg, min_write_interval);
    let feed = TemperatureFeed::Direct(thermal_sensor(config)?);

    let token = CancellationToken::new();
    let fire = tokio::spawn(run_keyboard_fire(engine, feed, cfg, period, token.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for SIGINT")?;
    token.cancel();
    fire.await.context("Fire effect task failed")?
}

fn thermal_sensor(config: &Config) -> Result<Arc<dyn TemperatureSensor>> {
    let source = ThermalZoneSource::discover(&config.thermal.root, &config.thermal.zones)
        .context("Failed to discover thermal zones")?;
    Ok(Arc::new(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cli::Switch,
        drivers::i2c_ec::{
            controller::{BacklightMode, RegisterWrite, Rgb},
            fake::FakeEc,
            test_session,
        },
        error::{EcError, RejectReason},
        models::{FanSpec, RpmModel},
    };
    use pretty_assertions::assert_eq;

    fn limits() -> EffectLimits {
        EffectLimits {
            max_fan_step: 32,
            max_sequence: Duration::from_secs(10),
        }
    }

    #[test]
    fn rpm_target_goes_through_fit() {
        let model = &MODELS[0];
        let command = EffectCommand::FanSpeed {
            value: 3000,
            rpm: true,
            fan: 0,
        };
        let seq = build_sequence(&command, model, limits()).unwrap();
        let RegisterWrite::FanSpeed { fan, speed } = seq.steps()[0].write else {
            panic!("expected a fan speed write");
        };
        assert_eq!(fan, 0);
        assert!((70..=74).contains(&speed), "speed {speed}");
    }

    #[test]
    fn rpm_target_on_convex_fit_is_reported() {
        let base = MODELS[0].fans[0];
        let rpm_model = base.rpm_model.map(|m| RpmModel { a: 0.05, ..m });
        let fans: &'static [FanSpec] = Box::leak(Box::new([FanSpec { rpm_model, ..base }]));
        let model = Model { fans, ..MODELS[0] };
        let command = EffectCommand::FanSpeed {
            value: 3000,
            rpm: true,
            fan: 0,
        };

        let err = build_sequence(&command, &model, limits()).unwrap_err();
        assert!(err.to_string().contains("no rising branch"), "{err}");
    }

    #[test]
    fn raw_speed_out_of_range_is_refused() {
        let command = EffectCommand::FanSpeed {
            value: 300,
            rpm: false,
            fan: 0,
        };
        assert!(build_sequence(&command, &MODELS[0], limits()).is_err());
    }

    #[test]
    fn ramp_hold_never_undercuts_write_interval() {
        let command = EffectCommand::Ramp {
            from: 0,
            to: 64,
            fan: 1,
            step: None,
            hold_ms: 10,
        };
        let seq = build_sequence(&command, &MODELS[0], limits()).unwrap();
        assert_eq!(seq.steps().len(), 3);
        assert_eq!(seq.steps()[0].hold, Duration::from_millis(500));
    }

    #[test]
    fn simple_commands_map_to_one_write() {
        let cases = [
            (
                EffectCommand::FanMode {
                    mode: FanMode::Manual,
                },
                RegisterWrite::FanMode(FanMode::Manual),
            ),
            (
                EffectCommand::Profile { index: 2 },
                RegisterWrite::Profile(2),
            ),
            (
                EffectCommand::SuspendMode { state: Switch::On },
                RegisterWrite::SuspendMode(true),
            ),
            (
                EffectCommand::Keyboard {
                    color: Rgb { r: 1, g: 2, b: 3 },
                    mode: BacklightMode::Strobe,
                    period: 3,
                },
                RegisterWrite::KeyboardBacklight(Backlight {
                    mode: BacklightMode::Strobe,
                    color: Rgb { r: 1, g: 2, b: 3 },
                    period: 3,
                }),
            ),
        ];
        for (command, expected) in cases {
            let seq = build_sequence(&command, &MODELS[0], limits()).unwrap();
            assert_eq!(seq.steps().len(), 1);
            assert_eq!(seq.steps()[0].write, expected);
        }
    }

    #[tokio::test]
    async fn unknown_profile_never_reaches_bus() {
        let fake = FakeEc::new();
        let engine = EffectsEngine::new(test_session(&fake), limits());
        let seq = build_sequence(&EffectCommand::Profile { index: 9 }, &MODELS[0], limits())
            .unwrap();

        let err = engine.apply_effect(seq).await.unwrap_err();
        assert!(matches!(
            err,
            EcError::Rejected {
                reason: RejectReason::Unsupported(_),
                ..
            }
        ));
        assert_eq!(fake.transfer_count(), 0);
    }
}
