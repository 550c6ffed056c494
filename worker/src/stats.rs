use std::time::Duration;

/// Scalar losses accumulated between progress reports.
///
/// Unbounded between flushes; the coordinator clears it after every report.
#[derive(Debug, Default)]
pub struct LossWindow {
    samples: Vec<f32>,
}

impl LossWindow {
    pub fn push(&mut self, loss: f32) {
        self.samples.push(loss);
    }

    /// Mean of the window, `None` when empty.
    pub fn mean(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f32>() / self.samples.len() as f32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Remaining wall time estimated from the average step duration so far.
///
/// `None` at `it == 0`: the estimate is undefined before the first step, so
/// reporting must not trigger earlier.
pub fn eta(max_iteration: usize, it: usize, total_elapsed: Duration) -> Option<Duration> {
    if it == 0 {
        return None;
    }

    let per_step = total_elapsed.as_secs_f64() / it as f64;
    let remaining = max_iteration.saturating_sub(it) as f64;
    Some(Duration::from_secs_f64(per_step * remaining))
}

/// `H:MM:SS` with a day prefix when needed, like a printed `timedelta`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    match days {
        0 => format!("{hours}:{minutes:02}:{seconds:02}"),
        1 => format!("1 day, {hours}:{minutes:02}:{seconds:02}"),
        n => format!("{n} days, {hours}:{minutes:02}:{seconds:02}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_mean_and_reset() {
        let mut window = LossWindow::default();
        assert_eq!(window.mean(), None);

        window.push(1.0);
        window.push(2.0);
        window.push(6.0);
        assert_eq!(window.len(), 3);
        assert!((window.mean().unwrap() - 3.0).abs() < 1e-7);

        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.mean(), None);
    }

    #[test]
    fn eta_matches_the_reporting_formula() {
        // (max_iteration - it) * (glob_t_intv / it)
        let value = eta(100, 20, Duration::from_secs(40)).unwrap();
        assert_eq!(value, Duration::from_secs(160));
    }

    #[test]
    fn eta_is_undefined_before_the_first_step() {
        assert_eq!(eta(100, 0, Duration::from_secs(40)), None);
    }

    #[test]
    fn eta_past_the_end_is_zero() {
        let value = eta(100, 100, Duration::from_secs(40)).unwrap();
        assert_eq!(value, Duration::ZERO);
    }

    #[test]
    fn durations_format_like_timedeltas() {
        assert_eq!(format_duration(Duration::from_secs(5)), "0:00:05");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1 day, 1:01:01");
        assert_eq!(
            format_duration(Duration::from_secs(2 * 86_400 + 7_200)),
            "2 days, 2:00:00"
        );
    }
}
