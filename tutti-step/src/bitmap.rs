/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Packed bit sets.
//!
//! Node sets and the job-global core space are semantically *sets of dense
//! integer identifiers*.  [`Bitmap`] wraps [`bitvec`] with exactly the
//! algebra the step manager needs: intersect / union / subtract, subset
//! tests, set/clear counts, first/last set bit, pick-first-N, bit ranges,
//! and the `"0-3,5"` range format used by the state snapshot.
//!
//! Two index spaces exist and must not be unified:
//! * node bitmaps and `core_bitmap_job` index the *cluster* / *job-global
//!   core* space;
//! * `exit_node_bitmap` indexes the *step-local* node space
//!   (0..step-node-count).

use bitvec::prelude::*;

/// Fixed-width packed bit set.
///
/// All binary operations require both operands to have the same width; the
/// step manager only ever combines bitmaps drawn from the same index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: BitVec<u64, Lsb0>,
}

impl Bitmap {
    /// All-zero bitmap of `nbits` bits.
    pub fn new(nbits: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; nbits],
        }
    }

    /// All-one bitmap of `nbits` bits.
    ///
    /// Built bit-by-bit so the unused tail of the last storage word stays
    /// zero; the word-wise set operations below rely on that.
    pub fn filled(nbits: usize) -> Self {
        let mut bm = Self::new(nbits);
        for inx in 0..nbits {
            bm.bits.set(inx, true);
        }
        bm
    }

    /// Width in bits (not the number of set bits).
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    pub fn set(&mut self, inx: usize) {
        self.bits.set(inx, true);
    }

    pub fn clear(&mut self, inx: usize) {
        self.bits.set(inx, false);
    }

    /// Set every bit in `first..=last`.
    pub fn set_range(&mut self, first: usize, last: usize) {
        for inx in first..=last {
            self.bits.set(inx, true);
        }
    }

    pub fn test(&self, inx: usize) -> bool {
        self.bits.get(inx).map(|b| *b).unwrap_or(false)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Number of clear bits.
    pub fn clear_count(&self) -> usize {
        self.bits.count_zeros()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Index of the first set bit.
    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    /// Index of the last set bit.
    pub fn last_set(&self) -> Option<usize> {
        self.bits.last_one()
    }

    /// Iterate the indices of set bits in ascending order.
    ///
    /// Ascending iteration is what makes node picking deterministic and
    /// reproducible independent of request order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// `self &= other`
    pub fn and(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.size(), other.size());
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a &= *b;
        }
    }

    /// `self |= other`
    pub fn or(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.size(), other.size());
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a |= *b;
        }
    }

    /// `self &= !other` — remove every bit of `other` from `self`.
    pub fn and_not(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.size(), other.size());
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a &= !*b;
        }
    }

    /// True if every set bit of `self` is also set in `other` (`self ⊆ other`).
    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.size(), other.size());
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .all(|(a, b)| a & !b == 0)
    }

    /// New bitmap holding the first `cnt` set bits of `self`, or `None` if
    /// fewer than `cnt` bits are set.
    pub fn pick_cnt(&self, cnt: usize) -> Option<Bitmap> {
        if self.count() < cnt {
            return None;
        }
        let mut picked = Bitmap::new(self.size());
        for inx in self.iter_set().take(cnt) {
            picked.set(inx);
        }
        Some(picked)
    }

    /// Zero-origin position of set bit `inx` among the set bits of `self`
    /// (e.g. the job-local index of a cluster node), or `None` if `inx` is
    /// not set.
    pub fn position_of(&self, inx: usize) -> Option<usize> {
        if !self.test(inx) {
            return None;
        }
        Some(self.iter_set().take_while(|&i| i < inx).count())
    }

    /// Render as the compact range format, e.g. `"0-3,5"`.  Empty set
    /// renders as `""`.
    pub fn to_range_fmt(&self) -> String {
        let mut out = String::new();
        let mut run: Option<(usize, usize)> = None;
        for inx in self.iter_set() {
            match run {
                Some((first, last)) if inx == last + 1 => run = Some((first, inx)),
                Some((first, last)) => {
                    push_run(&mut out, first, last);
                    run = Some((inx, inx));
                }
                None => run = Some((inx, inx)),
            }
        }
        if let Some((first, last)) = run {
            push_run(&mut out, first, last);
        }
        out
    }

    /// Parse the range format produced by [`to_range_fmt`](Self::to_range_fmt)
    /// into a bitmap of width `nbits`.
    pub fn from_range_fmt(nbits: usize, fmt: &str) -> Result<Bitmap, String> {
        let mut bm = Bitmap::new(nbits);
        if fmt.is_empty() {
            return Ok(bm);
        }
        for part in fmt.split(',') {
            let (first, last) = match part.split_once('-') {
                Some((a, b)) => (
                    a.parse::<usize>().map_err(|_| bad_fmt(part))?,
                    b.parse::<usize>().map_err(|_| bad_fmt(part))?,
                ),
                None => {
                    let v = part.parse::<usize>().map_err(|_| bad_fmt(part))?;
                    (v, v)
                }
            };
            if first > last || last >= nbits {
                return Err(bad_fmt(part));
            }
            bm.set_range(first, last);
        }
        Ok(bm)
    }
}

fn push_run(out: &mut String, first: usize, last: usize) {
    if !out.is_empty() {
        out.push(',');
    }
    if first == last {
        out.push_str(&first.to_string());
    } else {
        out.push_str(&format!("{}-{}", first, last));
    }
}

fn bad_fmt(part: &str) -> String {
    format!("invalid bitmap range segment '{}'", part)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bitmap_is_empty() {
        let bm = Bitmap::new(70);
        assert_eq!(bm.size(), 70);
        assert_eq!(bm.count(), 0);
        assert_eq!(bm.clear_count(), 70);
        assert!(bm.is_empty());
    }

    #[test]
    fn filled_bitmap_has_every_bit() {
        let bm = Bitmap::filled(70);
        assert_eq!(bm.count(), 70);
        assert_eq!(bm.clear_count(), 0);
        assert!(Bitmap::new(70).is_subset_of(&bm));
    }

    #[test]
    fn set_test_clear_round_trip() {
        let mut bm = Bitmap::new(8);
        bm.set(3);
        assert!(bm.test(3));
        assert_eq!(bm.count(), 1);
        bm.clear(3);
        assert!(!bm.test(3));
    }

    #[test]
    fn test_out_of_range_is_false() {
        let bm = Bitmap::new(4);
        assert!(!bm.test(100));
    }

    #[test]
    fn first_and_last_set() {
        let mut bm = Bitmap::new(128);
        assert_eq!(bm.first_set(), None);
        bm.set(5);
        bm.set(90);
        assert_eq!(bm.first_set(), Some(5));
        assert_eq!(bm.last_set(), Some(90));
    }

    #[test]
    fn and_or_and_not() {
        let mut a = Bitmap::new(70);
        let mut b = Bitmap::new(70);
        a.set(1);
        a.set(65);
        b.set(65);
        b.set(2);

        let mut and = a.clone();
        and.and(&b);
        assert_eq!(and.iter_set().collect::<Vec<_>>(), vec![65]);

        let mut or = a.clone();
        or.or(&b);
        assert_eq!(or.iter_set().collect::<Vec<_>>(), vec![1, 2, 65]);

        a.and_not(&b);
        assert_eq!(a.iter_set().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn subset_test() {
        let mut small = Bitmap::new(16);
        let mut big = Bitmap::new(16);
        small.set(4);
        big.set(4);
        big.set(9);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
    }

    #[test]
    fn pick_cnt_takes_lowest_bits() {
        let mut bm = Bitmap::new(16);
        bm.set(2);
        bm.set(5);
        bm.set(9);
        let picked = bm.pick_cnt(2).unwrap();
        assert_eq!(picked.iter_set().collect::<Vec<_>>(), vec![2, 5]);
        assert!(bm.pick_cnt(4).is_none());
    }

    #[test]
    fn position_of_counts_set_bits_below() {
        let mut bm = Bitmap::new(16);
        bm.set(2);
        bm.set(5);
        bm.set(9);
        assert_eq!(bm.position_of(2), Some(0));
        assert_eq!(bm.position_of(9), Some(2));
        assert_eq!(bm.position_of(3), None);
    }

    #[test]
    fn range_fmt_round_trip() {
        let mut bm = Bitmap::new(32);
        bm.set_range(0, 3);
        bm.set(5);
        bm.set_range(9, 10);
        let fmt = bm.to_range_fmt();
        assert_eq!(fmt, "0-3,5,9-10");
        assert_eq!(Bitmap::from_range_fmt(32, &fmt).unwrap(), bm);
    }

    #[test]
    fn range_fmt_empty() {
        let bm = Bitmap::new(8);
        assert_eq!(bm.to_range_fmt(), "");
        assert_eq!(Bitmap::from_range_fmt(8, "").unwrap(), bm);
    }

    #[test]
    fn range_fmt_rejects_garbage() {
        assert!(Bitmap::from_range_fmt(8, "a-b").is_err());
        assert!(Bitmap::from_range_fmt(8, "5-2").is_err());
        assert!(Bitmap::from_range_fmt(8, "0-9").is_err());
    }
}
