use std::time::Duration;

use tracing::trace;

// Conservative initial estimate so the very first resend is not premature.
const RTTE_INITIAL_RTT: u32 = 300;

const RTTE_MIN_RESEND: u32 = 20;
const RTTE_MAX_RESEND: u32 = 10000;

/// Smoothed round-trip estimator. A pending reliable frame is retransmitted
/// once it has been outstanding for twice the smoothed RTT.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    // Milliseconds, to keep the struct small.
    srtt: u32,

    #[cfg(test)]
    forced_timeout: Option<Duration>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: RTTE_INITIAL_RTT,

            #[cfg(test)]
            forced_timeout: None,
        }
    }
}

impl RttEstimator {
    #[cfg(test)]
    pub fn force_timeout(&mut self, duration: Duration) {
        self.forced_timeout = Some(duration);
    }

    pub fn resend_timeout(&self) -> Duration {
        #[cfg(test)]
        if let Some(t) = self.forced_timeout {
            return t;
        }

        let ms = (self.srtt as u64 * 2).clamp(RTTE_MIN_RESEND as u64, RTTE_MAX_RESEND as u64);
        Duration::from_millis(ms)
    }

    pub fn sample(&mut self, measured: Duration) {
        let measured = measured.as_millis().min(u32::MAX as u128) as u32;
        // Widened so extreme samples cannot overflow the accumulator.
        self.srtt = ((self.srtt as u64 * 9 + measured as u64) / 10) as u32;
        trace!(
            sample = measured,
            srtt = self.srtt,
            resend = ?self.resend_timeout(),
            "rtte"
        );
    }

    #[cfg(test)]
    pub fn srtt_ms(&self) -> u32 {
        self.srtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_to_measured() {
        let mut rtte = RttEstimator::default();
        for _ in 0..100 {
            rtte.sample(Duration::from_millis(50));
        }
        // Integer EWMA settles just under the sample value.
        assert!((45..=50).contains(&rtte.srtt_ms()), "{}", rtte.srtt_ms());
        assert_eq!(rtte.resend_timeout(), Duration::from_millis(2 * rtte.srtt_ms() as u64));
    }

    #[test]
    fn test_extreme_samples_do_not_overflow() {
        let mut rtte = RttEstimator::default();
        // Saturates srtt near u32::MAX; the EWMA arithmetic must not wrap.
        for _ in 0..300 {
            rtte.sample(Duration::from_millis(u32::MAX as u64));
        }
        assert_eq!(
            rtte.resend_timeout(),
            Duration::from_millis(RTTE_MAX_RESEND as u64)
        );
    }

    #[test]
    fn test_resend_timeout_clamped() {
        let mut rtte = RttEstimator::default();
        for _ in 0..200 {
            rtte.sample(Duration::from_millis(1));
        }
        assert_eq!(rtte.resend_timeout(), Duration::from_millis(RTTE_MIN_RESEND as u64));

        for _ in 0..200 {
            rtte.sample(Duration::from_secs(100));
        }
        assert_eq!(rtte.resend_timeout(), Duration::from_millis(RTTE_MAX_RESEND as u64));
    }
}
