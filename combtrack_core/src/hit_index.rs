//! Per-layer eta/phi spatial index.
//!
//! Eta is covered by two overlapping partitions of width
//! `2 * eta_det / n_eta_parts`. The second scheme is shifted by half a
//! partition and has one partition fewer. The combined bin index is `2 * b`
//! for partition `b` of the first scheme and `2 * b + 1` for partition `b` of
//! the second, so `2 * n_eta_parts - 1` bins in total. Every hit in acceptance
//! is stored under its first-scheme bin and, where one exists, its
//! second-scheme bin.
//!
//! Inside each eta bin the hits are counting-sorted by phi sector, and each
//! sector records the contiguous `(start, count)` range it occupies. The
//! sectors of one eta bin therefore partition that bin's sorted index array
//! without gaps.

use crate::config::BuildConfig;
use crate::hit::{normalized_phi, Hit};
use std::f32::consts::{PI, TAU};
use std::ops::RangeInclusive;
use tracing::debug;

// ============================================================================
// BINNING
// ============================================================================

/// Eta-bin and phi-sector arithmetic, independent of any hit storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaPhiBinning {
    n_eta_parts: usize,
    eta_det: f32,
    n_phi_sectors: usize,
}

impl EtaPhiBinning {
    pub fn new(n_eta_parts: usize, eta_det: f32, n_phi_sectors: usize) -> Self {
        Self {
            n_eta_parts: n_eta_parts.max(1),
            eta_det,
            n_phi_sectors: n_phi_sectors.max(1),
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.n_eta_parts, config.eta_det, config.n_phi_sectors)
    }

    /// Number of combined eta bins.
    pub fn n_eta_bins(&self) -> usize {
        2 * self.n_eta_parts - 1
    }

    pub fn n_phi_sectors(&self) -> usize {
        self.n_phi_sectors
    }

    pub fn eta_det(&self) -> f32 {
        self.eta_det
    }

    /// Width of one partition of either scheme.
    pub fn part_width(&self) -> f32 {
        2.0 * self.eta_det / self.n_eta_parts as f32
    }

    pub fn phi_sector_width(&self) -> f32 {
        TAU / self.n_phi_sectors as f32
    }

    fn in_acceptance(&self, eta: f32) -> bool {
        eta.abs() <= self.eta_det
    }

    /// Combined bin whose partition holds `eta` most centrally.
    ///
    /// Bins are half a partition wide; the first and last bins extend to the
    /// acceptance edge.
    pub fn eta_bin(&self, eta: f32) -> Option<usize> {
        if !self.in_acceptance(eta) {
            return None;
        }
        let half = 0.5 * self.part_width();
        let last = self.n_eta_bins() - 1;
        if eta < half - self.eta_det {
            return Some(0);
        }
        if eta > self.eta_det - half {
            return Some(last);
        }
        let bin = ((eta + self.eta_det - 0.5 * half) / half).floor() as usize;
        Some(bin.min(last))
    }

    /// First-scheme bin and, if `eta` is covered by one, second-scheme bin.
    pub fn both_eta_bins(&self, eta: f32) -> (Option<usize>, Option<usize>) {
        if !self.in_acceptance(eta) {
            return (None, None);
        }
        let width = self.part_width();
        let b1 = self.scheme_one_part(eta);
        let b2 = ((eta + self.eta_det - 0.5 * width) / width).floor();
        let b2 = if b2 >= 0.0 && (b2 as usize) + 1 < self.n_eta_parts {
            Some(2 * b2 as usize + 1)
        } else {
            None
        };
        (Some(2 * b1), b2)
    }

    /// First-scheme partition of an in-acceptance eta; the upper edge
    /// belongs to the last partition.
    fn scheme_one_part(&self, eta: f32) -> usize {
        let part = ((eta + self.eta_det) / self.part_width()).floor();
        (part.max(0.0) as usize).min(self.n_eta_parts - 1)
    }

    /// Eta bins to enumerate for the window `[eta - deta, eta + deta]`.
    ///
    /// A window inside one combined bin is served by that bin alone. A wider
    /// window is served by the disjoint first-scheme partitions covering it,
    /// so no hit is enumerated twice. A window entirely outside acceptance
    /// yields no bins; otherwise it is clamped to the acceptance.
    pub fn eta_bins_for_window(&self, eta: f32, deta: f32) -> Vec<usize> {
        let (lo, hi) = (eta - deta, eta + deta);
        if !(hi >= -self.eta_det && lo <= self.eta_det) {
            return Vec::new();
        }
        let lo = lo.max(-self.eta_det);
        let hi = hi.min(self.eta_det);
        match (self.eta_bin(lo), self.eta_bin(hi)) {
            (Some(a), Some(b)) if a == b => vec![a],
            _ => {
                let (p_lo, p_hi) = (self.scheme_one_part(lo), self.scheme_one_part(hi));
                (p_lo..=p_hi).map(|p| 2 * p).collect()
            }
        }
    }

    /// Sector of an azimuth, `floor((phi + π) * sectors / 2π)`.
    pub fn phi_sector(&self, phi: f32) -> usize {
        let phi = normalized_phi(phi);
        let sector = ((phi + PI) / self.phi_sector_width()).floor();
        (sector.max(0.0) as usize).min(self.n_phi_sectors - 1)
    }

    /// Sector ranges covering `[phi - dphi, phi + dphi]`, in sweep order.
    ///
    /// When the lower sector exceeds the upper one the window crosses the
    /// -π/π seam and is split into `[minus, last]` and `[0, plus]`.
    pub fn phi_ranges(&self, phi: f32, dphi: f32) -> Vec<RangeInclusive<usize>> {
        let last = self.n_phi_sectors - 1;
        if 2.0 * dphi + self.phi_sector_width() >= TAU {
            return vec![0..=last];
        }
        let minus = self.phi_sector(phi - dphi);
        let plus = self.phi_sector(phi + dphi);
        if minus <= plus {
            vec![minus..=plus]
        } else {
            vec![minus..=last, 0..=plus]
        }
    }
}

// ============================================================================
// LAYER STORAGE
// ============================================================================

/// Contiguous range of one phi sector inside an eta bin's sorted index array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinInfo {
    pub start: u32,
    pub count: u32,
}

/// Search window around a predicted direction, half-widths already scaled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchWindow {
    pub eta: f32,
    pub deta: f32,
    pub phi: f32,
    pub dphi: f32,
}

/// A run of sorted hit indices inside one eta bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitRange {
    pub eta_bin: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default)]
struct EtaBinHits {
    /// Hit indices sorted by (phi sector, original index)
    sorted: Vec<u32>,
    sectors: Vec<BinInfo>,
}

/// Hits of one layer plus their eta/phi index. Read-only after build.
#[derive(Debug, Clone)]
pub struct LayerOfHits {
    radius: f32,
    hits: Vec<Hit>,
    binning: EtaPhiBinning,
    eta_bins: Vec<EtaBinHits>,
    n_outside: usize,
}

impl LayerOfHits {
    /// Bins `hits` (kept in their original order) by eta and phi.
    pub fn build(radius: f32, hits: Vec<Hit>, binning: EtaPhiBinning) -> Self {
        let n_bins = binning.n_eta_bins();
        let n_sectors = binning.n_phi_sectors();

        // Pass 1: bin assignment and per-sector counts
        let mut placement: Vec<(usize, Option<usize>, Option<usize>)> = Vec::with_capacity(hits.len());
        let mut counts = vec![vec![0u32; n_sectors]; n_bins];
        let mut n_outside = 0;
        for hit in &hits {
            let (b1, b2) = binning.both_eta_bins(hit.eta());
            let sector = binning.phi_sector(hit.phi());
            if b1.is_none() {
                n_outside += 1;
            }
            for bin in [b1, b2].into_iter().flatten() {
                counts[bin][sector] += 1;
            }
            placement.push((sector, b1, b2));
        }

        // Pass 2: prefix sums into sector starts
        let mut eta_bins: Vec<EtaBinHits> = counts
            .iter()
            .map(|sector_counts| {
                let mut accum = 0u32;
                let sectors = sector_counts
                    .iter()
                    .map(|&count| {
                        let info = BinInfo { start: accum, count };
                        accum += count;
                        info
                    })
                    .collect();
                EtaBinHits {
                    sorted: vec![0; accum as usize],
                    sectors,
                }
            })
            .collect();

        // Pass 3: stable fill keeps original order within a sector
        let mut fill: Vec<Vec<u32>> = eta_bins
            .iter()
            .map(|b| b.sectors.iter().map(|s| s.start).collect())
            .collect();
        for (idx, &(sector, b1, b2)) in placement.iter().enumerate() {
            for bin in [b1, b2].into_iter().flatten() {
                let slot = &mut fill[bin][sector];
                eta_bins[bin].sorted[*slot as usize] = idx as u32;
                *slot += 1;
            }
        }

        debug!(
            radius,
            n_hits = hits.len(),
            n_outside,
            "Built layer index"
        );

        Self {
            radius,
            hits,
            binning,
            eta_bins,
            n_outside,
        }
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    pub fn hit(&self, index: u32) -> &Hit {
        &self.hits[index as usize]
    }

    pub fn binning(&self) -> &EtaPhiBinning {
        &self.binning
    }

    /// Hits outside the eta acceptance; never returned by a query.
    pub fn n_outside(&self) -> usize {
        self.n_outside
    }

    pub fn bin_info(&self, eta_bin: usize, sector: usize) -> BinInfo {
        self.eta_bins[eta_bin].sectors[sector]
    }

    /// Index ranges covering the window, in enumeration order: eta bin,
    /// then phi sweep from the window's lower edge.
    pub fn select(&self, window: &SearchWindow) -> Vec<HitRange> {
        let mut ranges = Vec::new();
        let phi_ranges = self.binning.phi_ranges(window.phi, window.dphi);
        for eta_bin in self.binning.eta_bins_for_window(window.eta, window.deta) {
            let bin = &self.eta_bins[eta_bin];
            for sectors in &phi_ranges {
                let first = bin.sectors[*sectors.start()];
                let last = bin.sectors[*sectors.end()];
                let (start, end) = (first.start as usize, (last.start + last.count) as usize);
                if end > start {
                    ranges.push(HitRange { eta_bin, start, end });
                }
            }
        }
        ranges
    }

    /// Hit indices of one selected range.
    pub fn range_hits(&self, range: &HitRange) -> &[u32] {
        &self.eta_bins[range.eta_bin].sorted[range.start..range.end]
    }

    /// All hit indices in the window, in enumeration order.
    pub fn query(&self, window: &SearchWindow) -> Vec<u32> {
        self.select(window)
            .iter()
            .flat_map(|r| self.range_hits(r).iter().copied())
            .collect()
    }
}
