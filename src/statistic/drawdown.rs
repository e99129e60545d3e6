use crate::Timed;
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};

/// Peak-to-trough decline of a value during a specific period, as a fraction of the peak.
/// A measure of downside volatility.
#[derive(Debug, Clone, PartialEq, PartialOrd, Default, Deserialize, Serialize, Constructor)]
pub struct Drawdown {
    pub value: f64,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
}

impl Drawdown {
    /// Time period of the [`Drawdown`].
    pub fn duration(&self) -> TimeDelta {
        self.time_end.signed_duration_since(self.time_start)
    }
}

/// [`Drawdown`] generator over a stream of timed values (here: strategy equity).
#[derive(Debug, Clone, PartialEq, PartialOrd, Default, Deserialize, Serialize)]
pub struct DrawdownGenerator {
    pub peak: f64,
    pub drawdown_max: f64,
    pub time_peak: DateTime<Utc>,
    pub time_now: DateTime<Utc>,
}

impl DrawdownGenerator {
    /// Initialise from an initial [`Timed`] value.
    pub fn init(point: Timed<f64>) -> Self {
        Self {
            peak: point.value,
            drawdown_max: 0.0,
            time_peak: point.time,
            time_now: point.time,
        }
    }

    /// Update the internal state with the latest [`Timed`] value.
    ///
    /// If the drawdown period has ended (value recovers above the previous peak), returns
    /// `Some(Drawdown)` describing the completed period, else `None`.
    pub fn update(&mut self, point: Timed<f64>) -> Option<Drawdown> {
        self.time_now = point.time;

        if point.value > self.peak {
            let ended = self.generate();

            self.peak = point.value;
            self.drawdown_max = 0.0;
            self.time_peak = point.time;

            ended
        } else {
            if self.peak > 0.0 {
                let drawdown_current = (self.peak - point.value) / self.peak;
                if drawdown_current > self.drawdown_max {
                    self.drawdown_max = drawdown_current;
                }
            }
            None
        }
    }

    /// Generate the [`Drawdown`] at the current instant, if one is in progress.
    pub fn generate(&self) -> Option<Drawdown> {
        (self.drawdown_max > 0.0).then(|| Drawdown {
            value: self.drawdown_max,
            time_start: self.time_peak,
            time_end: self.time_now,
        })
    }
}

/// Largest [`Drawdown`] observed over a lifetime.
#[derive(Debug, Clone, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct MaxDrawdown(pub Drawdown);

/// [`MaxDrawdown`] generator.
#[derive(Debug, Clone, PartialEq, PartialOrd, Default, Deserialize, Serialize)]
pub struct MaxDrawdownGenerator {
    pub max: Option<Drawdown>,
}

impl MaxDrawdownGenerator {
    /// Update with the next completed [`Drawdown`].
    pub fn update(&mut self, drawdown: &Drawdown) {
        let max = match self.max.take() {
            Some(max) if max.value >= drawdown.value => max,
            _ => drawdown.clone(),
        };
        self.max = Some(max);
    }

    pub fn generate(&self) -> Option<MaxDrawdown> {
        self.max.clone().map(MaxDrawdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(minute: u32, value: f64) -> Timed<f64> {
        Timed::new(
            value,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap(),
        )
    }

    #[test]
    fn no_drawdown_while_rising() {
        let mut generator = DrawdownGenerator::init(point(0, 100.0));
        assert_eq!(generator.update(point(1, 110.0)), None);
        assert_eq!(generator.update(point(2, 120.0)), None);
        assert_eq!(generator.generate(), None);
    }

    #[test]
    fn drawdown_emitted_on_recovery_above_peak() {
        let mut generator = DrawdownGenerator::init(point(0, 100.0));
        assert_eq!(generator.update(point(1, 80.0)), None);
        assert_eq!(generator.update(point(2, 90.0)), None);

        let ended = generator.update(point(3, 105.0)).unwrap();
        assert!((ended.value - 0.2).abs() < 1e-12);
        assert_eq!(ended.time_start, point(0, 0.0).time);
        assert_eq!(ended.time_end, point(3, 0.0).time);
    }

    #[test]
    fn generate_reports_drawdown_in_progress() {
        let mut generator = DrawdownGenerator::init(point(0, 100.0));
        generator.update(point(1, 75.0));

        let current = generator.generate().unwrap();
        assert!((current.value - 0.25).abs() < 1e-12);
    }

    #[test]
    fn max_drawdown_keeps_largest() {
        let mut generator = MaxDrawdownGenerator::default();
        generator.update(&Drawdown::new(0.1, point(0, 0.0).time, point(1, 0.0).time));
        generator.update(&Drawdown::new(0.3, point(2, 0.0).time, point(3, 0.0).time));
        generator.update(&Drawdown::new(0.2, point(4, 0.0).time, point(5, 0.0).time));

        assert_eq!(generator.generate().unwrap().0.value, 0.3);
    }
}
