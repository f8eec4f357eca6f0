//! C6: latency-optimized write sizing.
//!
//! Chooses, for a given socket, whether outbound TLS records should be
//! shrunk to fit a single TCP segment ("tiny records", minimizing the
//! latency of the first flight) or left at their maximum size (once the
//! connection is carrying enough data that per-segment alignment no longer
//! matters). The decision is driven by live `TCP_INFO` telemetry and is
//! permanently disabled the moment the platform or connection can't supply
//! what it needs -- once `Disabled`, a socket never optimizes again.

use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    Tbd,
    Disabled,
    UseTinyTlsRecords,
    UseLargeTlsRecords,
    NeedsUpdate,
}

/// Per-cipher TLS record overhead, resolved by the caller from the
/// negotiated cipher suite. Each enumerated cipher maps explicitly to its
/// overhead; unknown ciphers disable optimization rather than falling
/// through to a default.
#[derive(Debug, Clone, Copy)]
pub enum CipherOverhead {
    /// Not a TLS socket; write-size suggestions are still produced but no
    /// record-size shrinking applies downstream.
    PlaintextSocket,
    /// AES-GCM (25 bytes: 5 header + 8 explicit nonce + 12 tag) or
    /// ChaCha20-Poly1305 (21 bytes: 5 header + 16 tag, implicit nonce --
    /// see `tls::cipher_suite_overhead` for the per-suite mapping).
    Known(u32),
    /// TLS active but the cipher has no recognized overhead mapping.
    Unknown,
}

pub const SIZE_MAX: usize = usize::MAX;
const MIN_NOTSENT_LOWAT: u32 = 1;
const LARGE_RECORD_THRESHOLD: u32 = 65536;
const MAX_RECORD_PAYLOAD: usize = 16384;
const FALLBACK_RECORD_SIZE: usize = 1400;

#[derive(Debug, Clone, Copy)]
struct Telemetry {
    rtt: Duration,
    mss: u32,
    cwnd: u32,
    unacked: u32,
}

pub struct LatencyState {
    mode: LatencyMode,
    mss: u32,
    tls_overhead: u32,
}

impl LatencyState {
    pub fn new() -> Self {
        Self { mode: LatencyMode::Tbd, mss: 0, tls_overhead: 0 }
    }

    pub fn mode(&self) -> LatencyMode {
        self.mode
    }

    /// Returns the suggested write length, or `SIZE_MAX` when there's no
    /// useful cap (large-record mode, or the optimizer just disabled
    /// itself).
    pub fn prepare_for_latency_optimized_write(
        &mut self,
        fd: RawFd,
        minimum_rtt: Duration,
        cipher_overhead: CipherOverhead,
    ) -> usize {
        if self.mode == LatencyMode::Disabled {
            return SIZE_MAX;
        }

        if self.mode == LatencyMode::Tbd {
            let telemetry = match read_tcp_info(fd) {
                Some(t) => t,
                None => {
                    self.mode = LatencyMode::Disabled;
                    return SIZE_MAX;
                }
            };

            if telemetry.rtt < minimum_rtt {
                self.mode = LatencyMode::Disabled;
                return SIZE_MAX;
            }

            let overhead = match cipher_overhead {
                CipherOverhead::PlaintextSocket => 0,
                CipherOverhead::Known(n) => n,
                CipherOverhead::Unknown => {
                    self.mode = LatencyMode::Disabled;
                    return SIZE_MAX;
                }
            };

            if set_notsent_lowat(fd, MIN_NOTSENT_LOWAT).is_err() {
                self.mode = LatencyMode::Disabled;
                return SIZE_MAX;
            }

            self.tls_overhead = overhead;
            self.mss = telemetry.mss;
            return self.decide(telemetry.cwnd, telemetry.unacked);
        }

        // NEEDS_UPDATE (and, defensively, any other non-terminal mode):
        // refetch telemetry; a transient failure here doesn't disable the
        // optimizer, it just skips this write's recalculation.
        let telemetry = match read_tcp_info(fd) {
            Some(t) => t,
            None => return SIZE_MAX,
        };
        self.decide(telemetry.cwnd, telemetry.unacked)
    }

    fn decide(&mut self, cwnd: u32, unacked: u32) -> usize {
        if (self.mss as u64) * (cwnd as u64) >= LARGE_RECORD_THRESHOLD as u64 {
            self.mode = LatencyMode::UseLargeTlsRecords;
            return SIZE_MAX;
        }

        self.mode = LatencyMode::UseTinyTlsRecords;
        let packets_sendable = cwnd.saturating_sub(unacked);
        ((packets_sendable as usize) + 1) * (self.mss as usize - self.tls_overhead as usize)
    }

    /// Write-path record size decision.
    pub fn ssl_record_size(&mut self) -> usize {
        match self.mode {
            LatencyMode::UseTinyTlsRecords | LatencyMode::NeedsUpdate => {
                self.mode = LatencyMode::NeedsUpdate;
                self.mss as usize
            }
            LatencyMode::UseLargeTlsRecords => {
                self.mode = LatencyMode::NeedsUpdate;
                MAX_RECORD_PAYLOAD - self.tls_overhead as usize
            }
            _ => FALLBACK_RECORD_SIZE,
        }
    }
}

impl Default for LatencyState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn read_tcp_info(fd: RawFd) -> Option<Telemetry> {
    use std::mem;

    unsafe {
        let mut info: libc::tcp_info = mem::zeroed();
        let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let rc = libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if rc != 0 {
            return None;
        }
        Some(Telemetry {
            rtt: Duration::from_micros(info.tcpi_rtt as u64),
            mss: info.tcpi_snd_mss,
            cwnd: info.tcpi_snd_cwnd,
            unacked: info.tcpi_unacked,
        })
    }
}

#[cfg(target_os = "linux")]
fn set_notsent_lowat(fd: RawFd, value: u32) -> std::io::Result<()> {
    unsafe {
        let rc = libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NOTSENT_LOWAT,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        );
        if rc != 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Platforms without `TCP_INFO`/`TCP_NOTSENT_LOWAT` permanently disable the
/// optimizer.
#[cfg(not(target_os = "linux"))]
fn read_tcp_info(_fd: RawFd) -> Option<Telemetry> {
    None
}

#[cfg(not(target_os = "linux"))]
fn set_notsent_lowat(_fd: RawFd, _value: u32) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_in_mode(mode: LatencyMode, mss: u32, tls_overhead: u32) -> LatencyState {
        LatencyState { mode, mss, tls_overhead }
    }

    #[test]
    fn boundary_cwnd_times_mss_exactly_65535_is_tiny() {
        let mut s = state_in_mode(LatencyMode::Tbd, 1, 0);
        let size = s.decide(65535, 0);
        assert_eq!(s.mode(), LatencyMode::UseTinyTlsRecords);
        assert_eq!(size, 1 * (0 + 1));
    }

    #[test]
    fn boundary_cwnd_times_mss_exactly_65536_is_large() {
        let mut s = state_in_mode(LatencyMode::Tbd, 65536, 0);
        let size = s.decide(1, 0);
        assert_eq!(s.mode(), LatencyMode::UseLargeTlsRecords);
        assert_eq!(size, SIZE_MAX);
    }

    #[test]
    fn suggested_write_size_matches_worked_example() {
        // MSS=1460, cwnd=10, unacked=2, AES-GCM overhead=25 -> (10-2+1)*(1460-25)
        let mut s = state_in_mode(LatencyMode::Tbd, 1460, 25);
        let size = s.decide(10, 2);
        assert_eq!(s.mode(), LatencyMode::UseTinyTlsRecords);
        assert_eq!(size, 9 * 1435);
        assert_eq!(size, 12915);
    }

    #[test]
    fn ssl_record_size_transitions_to_needs_update() {
        let mut s = state_in_mode(LatencyMode::UseTinyTlsRecords, 1460, 25);
        assert_eq!(s.ssl_record_size(), 1460);
        assert_eq!(s.mode(), LatencyMode::NeedsUpdate);

        let mut s = state_in_mode(LatencyMode::UseLargeTlsRecords, 1460, 25);
        assert_eq!(s.ssl_record_size(), 16384 - 25);
        assert_eq!(s.mode(), LatencyMode::NeedsUpdate);

        let mut s = state_in_mode(LatencyMode::Disabled, 0, 0);
        assert_eq!(s.ssl_record_size(), FALLBACK_RECORD_SIZE);
    }

    #[test]
    fn disabled_is_absorbing() {
        let mut s = state_in_mode(LatencyMode::Disabled, 0, 0);
        let size = s.prepare_for_latency_optimized_write(-1, Duration::from_millis(1), CipherOverhead::PlaintextSocket);
        assert_eq!(size, SIZE_MAX);
        assert_eq!(s.mode(), LatencyMode::Disabled);
    }
}
