//! Type conversions applied while migrating partitions between stages.

use crate::error::{ArchiveError, Result};
use crate::storage::{DbrType, Sample, SampleIter, SampleValue, TimeRange};
use tracing::debug;

/// A transform applied to a partition's event stream during ETL.
pub trait ConversionFunction: Send + Sync {
    /// Decides once per stream whether `convert` is needed.
    fn should_convert(&self, source: DbrType, window: TimeRange) -> bool;

    /// Lazily wraps `events`, producing one converted event per source event.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedConversion` up front when the types cannot be
    /// converted at all; per-event failures surface as stream items.
    fn convert<'a>(
        &self,
        source: DbrType,
        events: SampleIter<'a>,
        window: TimeRange,
    ) -> Result<SampleIter<'a>>;
}

/// Converts scalar events to a fixed target type.
///
/// Numeric types convert between each other with `as` casts, numbers format
/// into strings, and strings parse into numbers. Waveforms are rejected.
///
/// Narrowing saturates: values beyond the target's range clamp to its
/// bounds, NaN becomes 0 in integer types and fractions truncate toward
/// zero. Every clamped event is logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarConversion {
    target: DbrType,
}

impl ScalarConversion {
    /// Creates a conversion into `target`.
    pub fn new(target: DbrType) -> Self {
        Self { target }
    }

    /// Returns the target type.
    pub fn target(&self) -> DbrType {
        self.target
    }
}

impl ConversionFunction for ScalarConversion {
    fn should_convert(&self, source: DbrType, _window: TimeRange) -> bool {
        source != self.target
    }

    fn convert<'a>(
        &self,
        source: DbrType,
        events: SampleIter<'a>,
        _window: TimeRange,
    ) -> Result<SampleIter<'a>> {
        if source.is_waveform() || self.target.is_waveform() {
            return Err(ArchiveError::UnsupportedConversion(format!(
                "{:?} to {:?}: waveform conversions are not supported",
                source, self.target
            )));
        }
        let target = self.target;
        Ok(Box::new(events.map(move |event| {
            let mut sample = event?;
            sample.value = convert_value(&sample, target)?;
            Ok(sample)
        })))
    }
}

fn convert_value(sample: &Sample, target: DbrType) -> Result<SampleValue> {
    if sample.dbr_type() == target {
        return Ok(sample.value.clone());
    }
    if target == DbrType::ScalarString {
        let text = match &sample.value {
            SampleValue::Short(v) | SampleValue::Enum(v) => v.to_string(),
            SampleValue::Float(v) => v.to_string(),
            SampleValue::Byte(v) => v.to_string(),
            SampleValue::Int(v) => v.to_string(),
            SampleValue::Double(v) => v.to_string(),
            other => return Err(unsupported(other.dbr_type(), target)),
        };
        return Ok(SampleValue::String(text));
    }

    let number = match &sample.value {
        SampleValue::String(text) => text.trim().parse::<f64>().map_err(|_| {
            ArchiveError::UnsupportedConversion(format!(
                "event at {} holds {:?}, not a number",
                sample.timestamp, text
            ))
        })?,
        SampleValue::Short(v) | SampleValue::Enum(v) => f64::from(*v),
        SampleValue::Float(v) => f64::from(*v),
        SampleValue::Byte(v) => f64::from(*v),
        SampleValue::Int(v) => f64::from(*v),
        SampleValue::Double(v) => *v,
        other => return Err(unsupported(other.dbr_type(), target)),
    };
    if !fits(number, target) {
        debug!(
            timestamp = sample.timestamp,
            value = number,
            ?target,
            "value outside the target range, saturating"
        );
    }
    Ok(match target {
        DbrType::ScalarShort => SampleValue::Short(number as i16),
        DbrType::ScalarEnum => SampleValue::Enum(number as i16),
        DbrType::ScalarFloat => SampleValue::Float(number as f32),
        DbrType::ScalarByte => SampleValue::Byte(number as i8),
        DbrType::ScalarInt => SampleValue::Int(number as i32),
        DbrType::ScalarDouble => SampleValue::Double(number),
        other => return Err(unsupported(sample.dbr_type(), other)),
    })
}

/// Returns true if `number` converts into `target` without clamping.
fn fits(number: f64, target: DbrType) -> bool {
    let bounds = |min: f64, max: f64| (min..=max).contains(&number);
    match target {
        DbrType::ScalarShort | DbrType::ScalarEnum => {
            bounds(f64::from(i16::MIN), f64::from(i16::MAX))
        }
        DbrType::ScalarByte => bounds(f64::from(i8::MIN), f64::from(i8::MAX)),
        DbrType::ScalarInt => bounds(f64::from(i32::MIN), f64::from(i32::MAX)),
        DbrType::ScalarFloat => {
            !number.is_finite() || bounds(f64::from(f32::MIN), f64::from(f32::MAX))
        }
        _ => true,
    }
}

fn unsupported(source: DbrType, target: DbrType) -> ArchiveError {
    ArchiveError::UnsupportedConversion(format!("{:?} to {:?}", source, target))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(values: Vec<SampleValue>) -> SampleIter<'static> {
        Box::new(
            values
                .into_iter()
                .enumerate()
                .map(|(i, value)| Ok(Sample::new(i as i64, value))),
        )
    }

    const WINDOW: TimeRange = TimeRange { start: 0, end: 100 };

    #[test]
    fn test_number_to_string_preserves_order_and_metadata() {
        let conversion = ScalarConversion::new(DbrType::ScalarString);
        assert!(conversion.should_convert(DbrType::ScalarDouble, WINDOW));
        assert!(!conversion.should_convert(DbrType::ScalarString, WINDOW));

        let events: SampleIter<'static> = Box::new(
            vec![
                Ok(Sample::new(1, SampleValue::Double(1.5)).with_alarm(2, 3)),
                Ok(Sample::new(2, SampleValue::Double(-4.0))),
            ]
            .into_iter(),
        );
        let converted: Vec<Sample> = conversion
            .convert(DbrType::ScalarDouble, events, WINDOW)
            .unwrap()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].value, SampleValue::String("1.5".to_string()));
        assert_eq!((converted[0].severity, converted[0].status), (2, 3));
        assert_eq!(converted[1].timestamp, 2);
        assert_eq!(converted[1].value, SampleValue::String("-4".to_string()));
    }

    #[test]
    fn test_string_to_number() {
        let conversion = ScalarConversion::new(DbrType::ScalarInt);
        let converted: Vec<Result<Sample>> = conversion
            .convert(
                DbrType::ScalarString,
                stream(vec![
                    SampleValue::String(" 42 ".to_string()),
                    SampleValue::String("n/a".to_string()),
                ]),
                WINDOW,
            )
            .unwrap()
            .collect();
        assert_eq!(converted[0].as_ref().unwrap().value, SampleValue::Int(42));
        assert!(matches!(
            converted[1],
            Err(ArchiveError::UnsupportedConversion(_))
        ));
    }

    #[test]
    fn test_narrowing_saturates_at_target_bounds() {
        let into_short = ScalarConversion::new(DbrType::ScalarShort);
        let converted: Vec<SampleValue> = into_short
            .convert(
                DbrType::ScalarInt,
                stream(vec![
                    SampleValue::Int(70_000),
                    SampleValue::Int(-70_000),
                    SampleValue::Int(12),
                ]),
                WINDOW,
            )
            .unwrap()
            .map(|event| event.unwrap().value)
            .collect();
        assert_eq!(
            converted,
            vec![
                SampleValue::Short(i16::MAX),
                SampleValue::Short(i16::MIN),
                SampleValue::Short(12)
            ]
        );

        let into_int = ScalarConversion::new(DbrType::ScalarInt);
        let converted: Vec<SampleValue> = into_int
            .convert(
                DbrType::ScalarDouble,
                stream(vec![SampleValue::Double(f64::NAN), SampleValue::Double(-2.9)]),
                WINDOW,
            )
            .unwrap()
            .map(|event| event.unwrap().value)
            .collect();
        assert_eq!(converted, vec![SampleValue::Int(0), SampleValue::Int(-2)]);

        assert!(fits(127.0, DbrType::ScalarByte));
        assert!(!fits(128.0, DbrType::ScalarByte));
        assert!(!fits(f64::NAN, DbrType::ScalarInt));
        assert!(fits(f64::NAN, DbrType::ScalarFloat));
        assert!(!fits(1e300, DbrType::ScalarFloat));
    }

    #[test]
    fn test_waveforms_fail_fast() {
        let into_waveform = ScalarConversion::new(DbrType::WaveformDouble);
        assert!(matches!(
            into_waveform.convert(DbrType::ScalarDouble, stream(vec![]), WINDOW),
            Err(ArchiveError::UnsupportedConversion(_))
        ));
        let from_waveform = ScalarConversion::new(DbrType::ScalarDouble);
        assert!(matches!(
            from_waveform.convert(
                DbrType::WaveformDouble,
                stream(vec![SampleValue::DoubleArray(vec![1.0])]),
                WINDOW
            ),
            Err(ArchiveError::UnsupportedConversion(_))
        ));
    }
}
