//! Centralized configuration for hkmedia.
//!
//! The thresholds here are coupled to undocumented timeouts in HomeKit Secure
//! Video and in FFmpeg's input handling, so they live in one place and can be
//! overridden per deployment instead of being inlined at their call sites.

use std::path::PathBuf;
use std::time::Duration;

/// HomeKit Secure Video drops a recording if a segment takes longer than 5s.
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_millis(4500);

/// FFmpeg abandons an idle RTP input after roughly 5s.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Grace period between the termination signal and the forced kill.
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(5);

/// Largest box the segmenter will buffer. HomeKit fragments are a few
/// seconds of video; anything near this size is a corrupt header.
pub const DEFAULT_MAX_BOX_SIZE: u64 = 64 * 1024 * 1024;

/// Upper bound on bind attempts for a single port reservation.
pub const DEFAULT_PORT_ATTEMPTS: u32 = 10;

/// Central configuration for all hkmedia components.
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub process: ProcessConfig,
    pub segments: SegmentConfig,
    pub rtp: RtpConfig,
    pub ports: PortConfig,
}

/// Transcoder process supervision settings.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Program spawned by the supervisor
    pub ffmpeg_path: PathBuf,
    /// Delay between SIGTERM and SIGKILL during stop
    pub kill_delay: Duration,
    /// Read buffer size for the transcoder's stdout
    pub read_chunk_size: usize,
    /// Number of stderr lines retained for error reports
    pub stderr_log_limit: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            kill_delay: DEFAULT_KILL_DELAY,
            read_chunk_size: 64 * 1024, // 64 KiB
            stderr_log_limit: 500,
        }
    }
}

/// Segment delivery settings.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Maximum wait for the next box before the generator gives up
    pub segment_timeout: Duration,
    /// Declared box sizes above this are treated as corrupt output
    pub max_box_size: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
            max_box_size: DEFAULT_MAX_BOX_SIZE,
        }
    }
}

/// RTP/RTCP demultiplexer settings.
#[derive(Debug, Clone)]
pub struct RtpConfig {
    /// Interval at which the last RTCP packet is replayed to the RTP port
    pub heartbeat_interval: Duration,
    /// Receive buffer size; larger datagrams are truncated by the OS
    pub max_datagram_size: usize,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_datagram_size: 65535,
        }
    }
}

/// UDP port allocation settings.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Attempts before a reservation reports exhaustion
    pub max_attempts: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_PORT_ATTEMPTS,
        }
    }
}

impl MediaConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparsable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HKMEDIA_FFMPEG_PATH")
            && !path.is_empty()
        {
            config.process.ffmpeg_path = PathBuf::from(path);
        }

        if let Some(delay) = env_millis("HKMEDIA_KILL_DELAY_MS") {
            config.process.kill_delay = delay;
        }

        if let Some(timeout) = env_millis("HKMEDIA_SEGMENT_TIMEOUT_MS") {
            config.segments.segment_timeout = timeout;
        }

        if let Ok(size) = std::env::var("HKMEDIA_MAX_BOX_SIZE")
            && let Ok(size) = size.parse::<u64>()
        {
            config.segments.max_box_size = size;
        }

        if let Some(interval) = env_millis("HKMEDIA_HEARTBEAT_INTERVAL_MS") {
            config.rtp.heartbeat_interval = interval;
        }

        if let Ok(attempts) = std::env::var("HKMEDIA_PORT_ATTEMPTS")
            && let Ok(count) = attempts.parse::<u32>()
        {
            config.ports.max_attempts = count;
        }

        config
    }

    /// Creates a configuration with short deadlines for tests.
    pub fn for_testing() -> Self {
        Self {
            process: ProcessConfig {
                kill_delay: Duration::from_millis(300),
                ..Default::default()
            },
            segments: SegmentConfig {
                segment_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            rtp: RtpConfig {
                heartbeat_interval: Duration::from_millis(100),
                ..Default::default()
            },
            ports: PortConfig::default(),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = MediaConfig::default();

        assert_eq!(config.process.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.process.kill_delay, Duration::from_secs(5));
        assert_eq!(config.segments.segment_timeout, Duration::from_millis(4500));
        assert_eq!(config.segments.max_box_size, 64 * 1024 * 1024);
        assert_eq!(config.rtp.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.ports.max_attempts, 10);
    }

    #[test]
    fn test_deadlines_stay_under_external_limits() {
        assert!(DEFAULT_SEGMENT_TIMEOUT < Duration::from_secs(5));
        assert!(DEFAULT_HEARTBEAT_INTERVAL < Duration::from_secs(5));
    }

    #[test]
    fn test_testing_preset_is_faster() {
        let config = MediaConfig::for_testing();
        assert!(config.segments.segment_timeout < DEFAULT_SEGMENT_TIMEOUT);
        assert!(config.rtp.heartbeat_interval < DEFAULT_HEARTBEAT_INTERVAL);
        assert!(config.process.kill_delay < DEFAULT_KILL_DELAY);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("HKMEDIA_FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");
            std::env::set_var("HKMEDIA_KILL_DELAY_MS", "2500");
            std::env::set_var("HKMEDIA_SEGMENT_TIMEOUT_MS", "4000");
            std::env::set_var("HKMEDIA_HEARTBEAT_INTERVAL_MS", "not-a-number");
            std::env::set_var("HKMEDIA_PORT_ATTEMPTS", "3");
        }

        let config = MediaConfig::from_env();

        assert_eq!(
            config.process.ffmpeg_path,
            PathBuf::from("/opt/ffmpeg/bin/ffmpeg")
        );
        assert_eq!(config.process.kill_delay, Duration::from_millis(2500));
        assert_eq!(config.segments.segment_timeout, Duration::from_millis(4000));
        assert_eq!(config.rtp.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.ports.max_attempts, 3);

        // Cleanup
        unsafe {
            std::env::remove_var("HKMEDIA_FFMPEG_PATH");
            std::env::remove_var("HKMEDIA_KILL_DELAY_MS");
            std::env::remove_var("HKMEDIA_SEGMENT_TIMEOUT_MS");
            std::env::remove_var("HKMEDIA_HEARTBEAT_INTERVAL_MS");
            std::env::remove_var("HKMEDIA_PORT_ATTEMPTS");
        }
    }
}
