use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

fn parse_duration(arg: &str) -> Result<Duration, humantime::DurationError> {
    arg.parse::<humantime::Duration>().map(Into::into)
}

#[derive(Debug, Parser)]
#[command(
    name = "capshell",
    version,
    about = r#"
capshell is the shell-side controller of a profiling daemon for Arm Linux and
Android targets. It spawns the collection agents, captures perf event data
and forwards the capture stream into the output directory.

EXAMPLES:
    # Capture the whole system for ten seconds:
    capshell --duration 10s -o my.capture

    # Launch a command under the capture:
    capshell -o my.capture -- ./yourcommand yourargs

    # Wait for an app to start and profile it:
    capshell --wait-process com.example.app -o my.capture
"#
)]
pub struct Opt {
    /// Output directory for the capture.
    #[arg(short, long, default_value = "capshell.capture")]
    pub output: PathBuf,

    /// Android package to run the low-privilege agents under (uses run-as).
    #[arg(long)]
    pub android_package: Option<String>,

    /// Also spawn the perfetto trace agent.
    #[arg(long)]
    pub perfetto: bool,

    /// Live capture: drain ring buffers on the fast (100ms) tick.
    #[arg(long)]
    pub live: bool,

    /// Stop the capture once this many bytes have been emitted (0 = never).
    #[arg(long, default_value_t = 0)]
    pub one_shot_limit: u64,

    /// Per-cpu perf data ring size in bytes; a power of two (0 = default).
    #[arg(long, default_value_t = 0)]
    pub buffer_size: u64,

    /// Per-cpu AUX ring size in bytes for hardware trace (SPE/ETM); a power
    /// of two (0 = no AUX ring).
    #[arg(long, default_value_t = 0)]
    pub aux_buffer_size: u64,

    /// Timeline sample frequency in Hz.
    #[arg(long, default_value_t = 1000)]
    pub sample_frequency: u64,

    /// Wait for a process with this command name to appear, then trace it.
    #[arg(long)]
    pub wait_process: Option<String>,

    /// End the capture after this long (e.g. "30s", "5m").
    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Command to launch under the capture.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_command_is_collected() {
        let opt = Opt::parse_from(["capshell", "-o", "out.capture", "--", "ls", "-l"]);
        assert_eq!(opt.command, vec!["ls".to_string(), "-l".to_string()]);
        assert_eq!(opt.output, PathBuf::from("out.capture"));
    }

    #[test]
    fn durations_parse_with_units() {
        let opt = Opt::parse_from(["capshell", "--duration", "10s"]);
        assert_eq!(opt.duration, Some(Duration::from_secs(10)));
    }

    #[test]
    fn defaults_are_sensible() {
        let opt = Opt::parse_from(["capshell"]);
        assert_eq!(opt.one_shot_limit, 0);
        assert_eq!(opt.sample_frequency, 1000);
        assert!(!opt.live);
        assert!(opt.command.is_empty());
    }
}
