//! Acceptance filters: matching, the fixed-size filter bank, and the
//! merge-based optimisation used to fit many filters into few slots.

use crate::{DataFrame, FrameFormat, MediaError, Result};
use core::fmt;

/// One acceptance filter.
///
/// A frame passes when `frame.identifier & mask == identifier & mask` and the
/// format matches (`None` accepts both formats).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FilterConfiguration {
    pub identifier: u32,
    pub mask: u32,
    pub format: Option<FrameFormat>,
}

impl FilterConfiguration {
    pub fn new(identifier: u32, mask: u32, format: Option<FrameFormat>) -> Result<Self> {
        let cfg = Self {
            identifier,
            mask,
            format,
        };
        let max = cfg.identifier_mask();
        if identifier > max {
            return Err(MediaError::InvalidFrame("filter identifier exceeds format width"));
        }
        if mask > max {
            return Err(MediaError::InvalidFrame("filter mask exceeds format width"));
        }
        Ok(cfg)
    }

    /// Accepts every frame of `format`, or every frame at all when `None`.
    pub fn new_promiscuous(format: Option<FrameFormat>) -> Self {
        Self {
            identifier: 0,
            mask: 0,
            format,
        }
    }

    /// Filter that no frame can pass. The identifier carries bit 11, which no
    /// base frame has, and the explicit base format rejects extended frames.
    pub fn dead() -> Self {
        let fmt = FrameFormat::Base;
        let out_of_range = fmt.max_identifier() + 1;
        Self {
            identifier: out_of_range,
            mask: out_of_range | fmt.max_identifier(),
            format: Some(fmt),
        }
    }

    /// Identifier width this filter operates on; 29 bits if format-agnostic.
    pub fn identifier_bit_length(&self) -> u32 {
        self.format.unwrap_or(FrameFormat::Extended).identifier_bit_length()
    }

    fn identifier_mask(&self) -> u32 {
        (1u32 << self.identifier_bit_length()) - 1
    }

    pub fn matches(&self, frame: &DataFrame) -> bool {
        frame.identifier() & self.mask == self.identifier & self.mask
            && self.format.map_or(true, |f| f == frame.format())
    }

    /// Specificity of the filter: set mask bits within the identifier width.
    ///
    /// Format-agnostic filters score below every format-specific one so the
    /// optimiser only produces them when nothing else is left to merge.
    pub fn rank(&self) -> i32 {
        let bits = (self.mask & self.identifier_mask()).count_ones() as i32;
        if self.format.is_none() {
            bits - self.identifier_bit_length() as i32
        } else {
            bits
        }
    }

    /// Smallest filter accepting everything either input accepts.
    pub fn merge(&self, other: &Self) -> Self {
        let mask = self.mask & other.mask & !(self.identifier ^ other.identifier);
        Self {
            identifier: self.identifier & mask,
            mask,
            format: if self.format == other.format {
                self.format
            } else {
                None
            },
        }
    }
}

impl fmt::Display for FilterConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_s = match self.format {
            Some(FrameFormat::Base) => "base",
            Some(FrameFormat::Extended) => "ext",
            None => "any",
        };
        write!(f, "{:08x}/{:08x} {fmt_s}", self.identifier, self.mask)
    }
}

/// True when the frame passes at least one filter of the bank.
pub fn accepts(frame: &DataFrame, bank: &[FilterConfiguration]) -> bool {
    bank.iter().any(|f| f.matches(frame))
}

/// Reduce `configurations` to at most `target` filters by repeatedly merging
/// the pair whose product has the highest rank. The accepted identifier set
/// only ever grows.
pub fn optimize_filter_configurations(
    configurations: &[FilterConfiguration],
    target: usize,
) -> Result<Vec<FilterConfiguration>> {
    if target < 1 {
        return Err(MediaError::ContractViolation(
            "target number of filter configurations must be positive",
        ));
    }
    let mut out = configurations.to_vec();
    while out.len() > target {
        let mut best: Option<(usize, usize, FilterConfiguration)> = None;
        for (ia, a) in out.iter().enumerate() {
            for (ib, b) in out.iter().enumerate() {
                if ia == ib {
                    continue;
                }
                let merged = a.merge(b);
                if best.map_or(true, |(_, _, m)| merged.rank() > m.rank()) {
                    best = Some((ia, ib, merged));
                }
            }
        }
        let Some((replace, remove, merged)) = best else {
            break;
        };
        out[replace] = merged;
        out.remove(remove);
    }
    Ok(out)
}

/// A fixed number of filter slots. Unconfigured slots hold the dead filter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterBank {
    slots: Vec<FilterConfiguration>,
}

impl FilterBank {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![FilterConfiguration::dead(); size],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[FilterConfiguration] {
        &self.slots
    }

    /// Replace every slot. Missing entries become dead filters so a prior,
    /// possibly promiscuous, filter never survives a partial update.
    pub fn reconfigure(&mut self, configuration: &[FilterConfiguration]) -> Result<()> {
        if configuration.len() > self.slots.len() {
            return Err(MediaError::ContractViolation(
                "more filter configurations than acceptance filters",
            ));
        }
        let mut slots = Vec::with_capacity(self.slots.len());
        slots.extend_from_slice(configuration);
        slots.resize(self.slots.len(), FilterConfiguration::dead());
        self.slots = slots;
        Ok(())
    }

    pub fn accepts(&self, frame: &DataFrame) -> bool {
        accepts(frame, &self.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, fmt: FrameFormat) -> DataFrame {
        DataFrame::new(id, vec![0], fmt, false).unwrap()
    }

    #[test]
    fn test_mask_rule() {
        let f = FilterConfiguration::new(123, 127, None).unwrap();
        assert!(f.matches(&frame(123, FrameFormat::Extended)));
        assert!(f.matches(&frame(123, FrameFormat::Base)));
        // Bits above the mask are ignored.
        assert!(f.matches(&frame(123 | 0x80, FrameFormat::Extended)));
        assert!(!f.matches(&frame(456, FrameFormat::Extended)));

        let f = FilterConfiguration::new(123, 127, Some(FrameFormat::Base)).unwrap();
        assert!(!f.matches(&frame(123, FrameFormat::Extended)));
    }

    #[test]
    fn test_promiscuous_accepts_everything() {
        let p = FilterConfiguration::new_promiscuous(None);
        for id in [0, 1, 0x7FF] {
            assert!(p.matches(&frame(id, FrameFormat::Base)));
        }
        for id in [0, 0x1234_5678, 0x1FFF_FFFF] {
            assert!(p.matches(&frame(id, FrameFormat::Extended)));
        }
    }

    #[test]
    fn test_dead_filter_matches_nothing() {
        let d = FilterConfiguration::dead();
        assert!(!d.matches(&frame(0, FrameFormat::Base)));
        assert!(!d.matches(&frame(0, FrameFormat::Extended)));
        assert!(!d.matches(&frame(0x800, FrameFormat::Extended)));
        assert!(!d.matches(&frame(1, FrameFormat::Base)));
        assert!(!d.matches(&frame(0x7FF, FrameFormat::Base)));
    }

    #[test]
    fn test_filter_width_validated() {
        assert!(FilterConfiguration::new(0x800, 0, Some(FrameFormat::Base)).is_err());
        assert!(FilterConfiguration::new(0, 0x800, Some(FrameFormat::Base)).is_err());
        assert!(FilterConfiguration::new(0x800, 0x1FFF_FFFF, None).is_ok());
        assert!(FilterConfiguration::new(0, 0x2000_0000, None).is_err());
    }

    #[test]
    fn test_bank_is_or_across_slots() {
        let bank = [
            FilterConfiguration::new(0x10, 0x7FF, Some(FrameFormat::Base)).unwrap(),
            FilterConfiguration::new(0x20, 0x7FF, Some(FrameFormat::Base)).unwrap(),
        ];
        assert!(accepts(&frame(0x10, FrameFormat::Base), &bank));
        assert!(accepts(&frame(0x20, FrameFormat::Base), &bank));
        assert!(!accepts(&frame(0x30, FrameFormat::Base), &bank));
        assert!(!accepts(&frame(0x10, FrameFormat::Base), &[]));
    }

    #[test]
    fn test_bank_reconfigure_pads_with_dead_filters() {
        let mut bank = FilterBank::new(3);
        assert!(!bank.accepts(&frame(5, FrameFormat::Base)));

        bank.reconfigure(&[FilterConfiguration::new_promiscuous(None); 3])
            .unwrap();
        assert!(bank.accepts(&frame(5, FrameFormat::Base)));

        let input = vec![FilterConfiguration::new(7, 0x7FF, Some(FrameFormat::Base)).unwrap()];
        bank.reconfigure(&input).unwrap();
        assert_eq!(input.len(), 1);
        assert_eq!(bank.len(), 3);
        assert_eq!(bank.slots()[1], FilterConfiguration::dead());
        assert_eq!(bank.slots()[2], FilterConfiguration::dead());
        assert!(!bank.accepts(&frame(5, FrameFormat::Base)));
        assert!(bank.accepts(&frame(7, FrameFormat::Base)));

        let too_many = [FilterConfiguration::new_promiscuous(None); 4];
        assert!(matches!(
            bank.reconfigure(&too_many),
            Err(MediaError::ContractViolation(_))
        ));
        assert_eq!(bank.len(), 3);
    }

    #[test]
    fn test_rank_and_merge() {
        let a = FilterConfiguration::new(0b1010, 0b1111, Some(FrameFormat::Base)).unwrap();
        let b = FilterConfiguration::new(0b1000, 0b1111, Some(FrameFormat::Base)).unwrap();
        assert_eq!(a.rank(), 4);
        let m = a.merge(&b);
        assert_eq!(m.mask, 0b1101);
        assert_eq!(m.identifier, 0b1000);
        assert_eq!(m.format, Some(FrameFormat::Base));
        assert_eq!(m.rank(), 3);

        let c = FilterConfiguration::new(0b1000, 0b1111, Some(FrameFormat::Extended)).unwrap();
        let m = a.merge(&c);
        assert_eq!(m.format, None);
        assert_eq!(m.rank(), 3 - 29);
        assert_eq!(FilterConfiguration::new_promiscuous(None).rank(), -29);
    }

    #[test]
    fn test_optimize_keeps_superset() {
        let cfgs = [
            FilterConfiguration::new(0x100, 0x7FF, Some(FrameFormat::Base)).unwrap(),
            FilterConfiguration::new(0x101, 0x7FF, Some(FrameFormat::Base)).unwrap(),
            FilterConfiguration::new(0x1234, 0x1FFF_FFFF, Some(FrameFormat::Extended)).unwrap(),
        ];
        let out = optimize_filter_configurations(&cfgs, 2).unwrap();
        assert_eq!(out.len(), 2);
        for id in [0x100, 0x101] {
            assert!(accepts(&frame(id, FrameFormat::Base), &out));
        }
        assert!(accepts(&frame(0x1234, FrameFormat::Extended), &out));
        // The two base filters merged; the extended one stays exact.
        assert!(out.iter().all(|f| f.format.is_some()));
        assert!(!accepts(&frame(0x102, FrameFormat::Base), &out));

        let one = optimize_filter_configurations(&cfgs, 1).unwrap();
        assert_eq!(one.len(), 1);
        assert!(accepts(&frame(0x1234, FrameFormat::Extended), &one));
        assert!(accepts(&frame(0x101, FrameFormat::Base), &one));
    }

    #[test]
    fn test_optimize_no_op_and_bad_target() {
        let cfgs = [FilterConfiguration::new_promiscuous(None)];
        assert_eq!(optimize_filter_configurations(&cfgs, 4).unwrap(), cfgs.to_vec());
        assert!(optimize_filter_configurations(&cfgs, 0).is_err());
    }
}
