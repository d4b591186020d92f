use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::drivers::i2c_ec::controller::{BacklightMode, DEFAULT_BACKLIGHT_PERIOD, FanMode, Rgb};

/// arm-ecd: embedded controller daemon for ARM laptops
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $ARM_ECD_CONFIG, ~/.config/arm-ecd/config.yml, /etc/arm-ecd/config.yml)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report the SoC temperature to the EC until stopped
    Run {
        /// Detach from the terminal
        #[arg(short = 'd', long = "daemonize")]
        daemonize: bool,
    },
    /// List supported models
    Models {
        #[arg(long)]
        json: bool,
    },
    /// Show fan speeds and the current temperature
    Status,
    /// Apply a single diagnostic effect and exit
    Effect {
        #[command(subcommand)]
        effect: EffectCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum EffectCommand {
    /// Hand fan control to the EC or take it over
    FanMode {
        #[arg(value_enum)]
        mode: FanMode,
    },
    /// Set a fan's raw speed (0-255), or a target RPM with --rpm
    FanSpeed {
        value: u32,
        #[arg(long)]
        rpm: bool,
        #[arg(long, default_value_t = 0)]
        fan: u8,
    },
    /// Move a fan between two speeds in bounded steps
    Ramp {
        from: u8,
        to: u8,
        #[arg(long, default_value_t = 0)]
        fan: u8,
        /// Largest change per step (defaults to the configured maximum)
        #[arg(long)]
        step: Option<u8>,
        /// Pause between steps in milliseconds (at least the write interval)
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },
    /// Select a fan profile by index
    Profile { index: u8 },
    /// Set the keyboard backlight colour (#rgb or #rrggbb)
    Keyboard {
        #[arg(value_parser = parse_rgb)]
        color: Rgb,
        #[arg(long, value_enum, default_value_t = BacklightMode::Solid)]
        mode: BacklightMode,
        #[arg(long, default_value_t = DEFAULT_BACKLIGHT_PERIOD)]
        period: u8,
    },
    /// Tell the EC the system is entering or leaving suspend
    SuspendMode {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Colour the keyboard after the current temperature
    Fire {
        /// Keep following the temperature until interrupted
        #[arg(long)]
        follow: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(value: Switch) -> Self {
        value == Switch::On
    }
}

fn parse_rgb(text: &str) -> Result<Rgb, String> {
    Rgb::parse_hex(text).ok_or_else(|| format!("'{text}' is not a #rgb or #rrggbb colour"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_daemon_invocation() {
        let cli = Cli::try_parse_from(["arm-ecd", "-v", "run", "-d", "-c", "/tmp/ec.yml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/ec.yml")));
        assert!(matches!(cli.command, Command::Run { daemonize: true }));
    }

    #[test]
    fn parses_keyboard_effect() {
        let cli =
            Cli::try_parse_from(["arm-ecd", "effect", "keyboard", "#f80", "--mode", "breathe"])
                .unwrap();
        let Command::Effect {
            effect: EffectCommand::Keyboard { color, mode, period },
        } = cli.command
        else {
            panic!("expected keyboard effect");
        };
        assert_eq!(color, Rgb { r: 0xff, g: 0x88, b: 0 });
        assert_eq!(mode, BacklightMode::Breathe);
        assert_eq!(period, DEFAULT_BACKLIGHT_PERIOD);
    }

    #[test]
    fn rejects_bad_colour_and_mode() {
        assert!(Cli::try_parse_from(["arm-ecd", "effect", "keyboard", "#12"]).is_err());
        assert!(Cli::try_parse_from(["arm-ecd", "effect", "fan-mode", "turbo"]).is_err());
    }

    #[test]
    fn suspend_switch_maps_to_bool() {
        let cli = Cli::try_parse_from(["arm-ecd", "effect", "suspend-mode", "on"]).unwrap();
        let Command::Effect {
            effect: EffectCommand::SuspendMode { state },
        } = cli.command
        else {
            panic!("expected suspend-mode effect");
        };
        assert!(bool::from(state));
    }
}
