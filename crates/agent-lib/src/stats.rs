//! Cumulative statistics model for metric observations
//!
//! Converts a stream of floating observations into a single integer load
//! result. In shaping mode the model runs a Z-score window over the
//! observations and, when a statistically significant trend appears,
//! translates the reported load along the trend instead of waiting for the
//! cumulative mean to catch up. The model is cumulative, so its memory
//! footprint is constant regardless of how many observations it has seen.

/// Maximum observations before a recentre is forced, bounding accumulated
/// floating point error in the running sums.
const DEFAULT_COUNT_LIMIT: u64 = 0x1000_0000;

/// Two-tailed Z-mean magnitude required for a trend to count as significant.
const DEFAULT_Z_THRESHOLD: f64 = 1.0;

/// Z-window samples required before significance is decided.
const DEFAULT_Z_INTERVAL: u64 = 5;

/// Online mean/stddev/Z-score engine with optional trend shaping.
#[derive(Debug, Clone)]
pub struct StatisticsModel {
    /// Last observation received.
    x_last: f64,
    /// Observation count in the current state (n).
    x_count: u64,
    /// The load currently reported by the model.
    reported_load: f64,
    /// Population standard deviation of the current state.
    std_dev: f64,
    /// Z-score of the last observation.
    z_value: f64,
    /// Running sum of x in the current state.
    x_sum: f64,
    /// Running sum of x^2 in the current state.
    x_squared_sum: f64,
    /// Smallest observation seen since the last full recentre.
    x_min: f64,
    /// Largest observation seen since the last full recentre.
    x_max: f64,
    /// Observation ceiling before a recentre is forced.
    x_count_limit: u64,
    /// Sum of Z-scores in the current Z-window.
    z_sum: f64,
    /// Mean of Z-scores in the current Z-window.
    z_mean: f64,
    /// Count of Z-scores in the current Z-window.
    z_count: u64,
    /// Significance threshold for the Z-mean.
    pub z_threshold: f64,
    /// Z-window samples required before deciding significance.
    pub z_interval: u64,
    /// Whether the model recentred during the last observation.
    recentred: bool,
    /// Whether statistics-based shaping is enabled.
    pub shaping: bool,
    /// The last integer result computed by the model.
    last_result: i64,
}

impl Default for StatisticsModel {
    fn default() -> Self {
        Self {
            x_last: 0.0,
            x_count: 0,
            reported_load: 0.0,
            std_dev: 0.0,
            z_value: 0.0,
            x_sum: 0.0,
            x_squared_sum: 0.0,
            x_min: 0.0,
            x_max: 0.0,
            x_count_limit: DEFAULT_COUNT_LIMIT,
            z_sum: 0.0,
            z_mean: 0.0,
            z_count: 0,
            z_threshold: DEFAULT_Z_THRESHOLD,
            z_interval: DEFAULT_Z_INTERVAL,
            recentred: false,
            shaping: false,
            last_result: 0,
        }
    }
}

impl StatisticsModel {
    pub fn new(shaping: bool) -> Self {
        Self {
            shaping,
            ..Self::default()
        }
    }

    /// Feeds one observation into the model and recomputes the result.
    pub fn observe(&mut self, value: f64) {
        if self.x_count + 1 > self.x_count_limit {
            // The running sums have absorbed as many observations as we
            // allow; collapse the state before continuing.
            self.recentre();
        } else {
            self.recentred = false;
            self.add_x_value(value);
            self.update_min_max();
            self.recalculate_mean();
            self.recalculate_std_dev();
            self.recalculate_z_scores();
        }
        if self.shaping {
            self.handle_z_window();
        } else {
            // Direct mode: the reported load is simply the last observation.
            self.reported_load = value;
        }
        self.last_result = self.reported_load.round() as i64;
    }

    /// The current integer load result.
    pub fn result(&self) -> i64 {
        self.last_result
    }

    /// Whether the model has received any observations yet.
    pub fn has_observations(&self) -> bool {
        self.x_count > 0
    }

    /// Whether the last observation caused a full recentre.
    pub fn was_recentred(&self) -> bool {
        self.recentred
    }

    /// Collapses the state into a single virtual observation at the
    /// currently reported load.
    pub fn recentre(&mut self) {
        self.x_count = 1;
        self.x_sum = self.reported_load;
        self.x_squared_sum = self.reported_load * self.reported_load;
        self.recentre_z_stats();
        self.x_min = self.x_last;
        self.x_max = self.x_last;
        self.recentred = true;
    }

    fn add_x_value(&mut self, value: f64) {
        self.x_sum += value;
        self.x_squared_sum += value * value;
        self.x_count += 1;
        self.x_last = value;
    }

    fn update_min_max(&mut self) {
        if self.x_count < 2 {
            self.x_min = self.x_last;
            self.x_max = self.x_last;
        } else {
            if self.x_min > self.x_last {
                self.x_min = self.x_last;
            }
            if self.x_max < self.x_last {
                self.x_max = self.x_last;
            }
        }
    }

    fn recalculate_mean(&mut self) {
        self.reported_load = self.x_sum / self.x_count as f64;
    }

    fn recalculate_std_dev(&mut self) {
        // Population formula from the cumulative sums:
        // sigma = sqrt(s2/n - (s1/n)^2)
        let n = self.x_count as f64;
        let mean = self.x_sum / n;
        let variance = (self.x_squared_sum / n) - mean * mean;
        // Guard the sqrt against tiny negative values from FP cancellation.
        self.std_dev = variance.max(0.0).sqrt();
    }

    fn recalculate_z_scores(&mut self) {
        // z = (x - mu) / sigma; defined as zero when sigma is zero.
        if self.std_dev.abs() > 0.0 {
            self.z_value = (self.x_last - self.reported_load) / self.std_dev;
        } else {
            self.z_value = 0.0;
        }
        self.z_count += 1;
        self.z_sum += self.z_value;
        self.z_mean = self.z_sum / self.z_count as f64;
    }

    /// Runs the moving Z-window: a significant Z-mean translates the
    /// reported load along the detected trend, clamps it to the observed
    /// min/max envelope and recentres the whole model around it. An
    /// insignificant window recentres only the Z statistics.
    fn handle_z_window(&mut self) {
        if self.z_threshold.abs() > 0.0 && self.z_count >= self.z_interval {
            if self.z_mean.abs() >= self.z_threshold {
                let translated = self.reported_load + self.z_mean * self.std_dev;
                self.reported_load = translated.clamp(self.x_min, self.x_max);
                self.recentre();
            } else {
                self.recentre_z_stats();
            }
        }
    }

    fn recentre_z_stats(&mut self) {
        self.z_count = 1;
        self.z_sum = self.z_value;
        self.z_mean = self.z_value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_mode_reports_last_observation() {
        let mut model = StatisticsModel::new(false);
        model.observe(10.0);
        model.observe(90.4);
        assert_eq!(model.result(), 90);
        model.observe(12.5);
        assert_eq!(model.result(), 13);
    }

    #[test]
    fn test_no_observations_reports_zero() {
        let model = StatisticsModel::new(false);
        assert!(!model.has_observations());
        assert_eq!(model.result(), 0);
    }

    #[test]
    fn test_zero_stddev_gives_zero_z_score() {
        let mut model = StatisticsModel::new(true);
        for _ in 0..4 {
            model.observe(50.0);
        }
        // All identical observations: sigma is 0, so no Z-score builds up
        // and the reported load stays on the mean.
        assert_eq!(model.result(), 50);
    }

    #[test]
    fn test_shaped_result_stays_within_observed_bounds() {
        let mut model = StatisticsModel::new(true);
        let samples = [
            20.0, 22.0, 21.0, 19.0, 23.0, 60.0, 65.0, 70.0, 72.0, 68.0, 71.0, 69.0,
        ];
        for s in samples {
            model.observe(s);
            let result = model.result() as f64;
            assert!(
                (19.0..=72.0).contains(&result),
                "result {result} outside observed bounds"
            );
        }
    }

    #[test]
    fn test_shaping_tracks_sustained_step_faster_than_mean() {
        let mut shaped = StatisticsModel::new(true);
        let mut mean_only = 0.0;
        let mut count = 0u64;
        // Sit at a low plateau, then step up and hold.
        let mut samples = vec![10.0; 20];
        samples.extend(vec![80.0; 10]);
        for s in &samples {
            shaped.observe(*s);
            mean_only += s;
            count += 1;
        }
        let cumulative_mean = mean_only / count as f64;
        // The shaped result should have moved well past the lagging
        // cumulative mean towards the new plateau.
        assert!(
            shaped.result() as f64 > cumulative_mean,
            "shaped {} should lead cumulative mean {}",
            shaped.result(),
            cumulative_mean
        );
    }

    #[test]
    fn test_recentre_collapses_to_single_observation() {
        let mut model = StatisticsModel::new(true);
        for s in [10.0, 20.0, 30.0, 40.0] {
            model.observe(s);
        }
        let before = model.result();
        model.recentre();
        assert!(model.was_recentred());
        assert_eq!(model.x_count, 1);
        assert!((model.x_sum - model.reported_load).abs() < f64::EPSILON);
        assert!(
            (model.x_squared_sum - model.reported_load * model.reported_load).abs() < 1e-9
        );
        // The reported result is preserved across the recentre.
        assert_eq!(model.result(), before);
    }

    #[test]
    fn test_forced_recentre_at_count_limit() {
        let mut model = StatisticsModel::new(false);
        model.x_count_limit = 4;
        for s in [10.0, 20.0, 30.0, 40.0] {
            model.observe(s);
        }
        assert!(!model.was_recentred());
        model.observe(50.0);
        assert!(model.was_recentred());
        assert_eq!(model.x_count, 1);
    }

    #[test]
    fn test_population_stddev_identity() {
        let mut model = StatisticsModel::new(false);
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        for s in samples {
            model.observe(s);
        }
        // Known population stddev of this classic set is exactly 2.
        assert!((model.std_dev - 2.0).abs() < 1e-9);
    }
}
