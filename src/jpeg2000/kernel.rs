//! Wavelet kernel descriptions.
//!
//! Only the properties the structural layer needs are kept here: the equivalent
//! synthesis/analysis impulse responses (for energy and BIBO gains), reversibility and
//! symmetry. The sample-domain transform itself lives outside this crate.

use crate::error::J2kError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// Reversible integer 5/3 (W5X3).
    Reversible53,
    /// Irreversible CDF 9/7 (W9X7).
    Irreversible97,
    /// Arbitrary odd-length kernel supplied by the caller.
    Custom,
}

/// Which branch of a two-channel split a stage follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Low = 0,
    High = 1,
    Unsplit = 2,
}

impl Branch {
    pub fn from_index(v: u8) -> Branch {
        match v {
            0 => Branch::Low,
            1 => Branch::High,
            _ => Branch::Unsplit,
        }
    }

    pub fn is_split(self) -> bool {
        self != Branch::Unsplit
    }

    pub fn is_high(self) -> bool {
        self == Branch::High
    }
}

// Beyond this many stages the responses are extrapolated geometrically.
const MAX_EXPLICIT_STAGES: usize = 14;

#[derive(Debug, Clone, PartialEq)]
pub struct KernelDescription {
    pub id: KernelId,
    pub reversible: bool,
    analysis_low: Vec<f64>,
    analysis_high: Vec<f64>,
    synthesis_low: Vec<f64>,
    synthesis_high: Vec<f64>,
}

impl KernelDescription {
    pub fn new(id: KernelId) -> Self {
        match id {
            KernelId::Reversible53 => {
                let synthesis_low = vec![0.5, 1.0, 0.5];
                let synthesis_high = vec![-0.125, -0.25, 0.75, -0.25, -0.125];
                Self::from_synthesis(id, true, synthesis_low, synthesis_high)
            }
            KernelId::Irreversible97 | KernelId::Custom => {
                let synthesis_low = vec![
                    -0.091_271_763_114_249_48,
                    -0.057_543_526_228_499_57,
                    0.591_271_763_114_247,
                    1.115_087_052_456_994,
                    0.591_271_763_114_247,
                    -0.057_543_526_228_499_57,
                    -0.091_271_763_114_249_48,
                ];
                let synthesis_high = vec![
                    0.026_748_757_410_809_76,
                    0.016_864_118_442_874_95,
                    -0.078_223_266_528_987_85,
                    -0.266_864_118_442_872_3,
                    0.602_949_018_236_357_9,
                    -0.266_864_118_442_872_3,
                    -0.078_223_266_528_987_85,
                    0.016_864_118_442_874_95,
                    0.026_748_757_410_809_76,
                ];
                Self::from_synthesis(KernelId::Irreversible97, false, synthesis_low, synthesis_high)
            }
        }
    }

    /// Builds a custom kernel from its synthesis filters. Both must have odd length.
    pub fn custom(
        reversible: bool,
        synthesis_low: Vec<f64>,
        synthesis_high: Vec<f64>,
    ) -> Result<Self, J2kError> {
        if synthesis_low.len() % 2 == 0 || synthesis_high.len() % 2 == 0 {
            return Err(J2kError::invalid("kernel", "synthesis filters must have odd length"));
        }
        Ok(Self::from_synthesis(
            KernelId::Custom,
            reversible,
            synthesis_low,
            synthesis_high,
        ))
    }

    fn from_synthesis(
        id: KernelId,
        reversible: bool,
        synthesis_low: Vec<f64>,
        synthesis_high: Vec<f64>,
    ) -> Self {
        let modulate = |taps: &[f64]| -> Vec<f64> {
            let centre = (taps.len() / 2) as i64;
            taps.iter()
                .enumerate()
                .map(|(n, &t)| if (n as i64 - centre) % 2 == 0 { t } else { -t })
                .collect()
        };
        Self {
            id,
            reversible,
            analysis_low: modulate(&synthesis_high),
            analysis_high: modulate(&synthesis_low),
            synthesis_low,
            synthesis_high,
        }
    }

    pub fn is_symmetric(&self) -> bool {
        let sym = |v: &[f64]| {
            (0..v.len() / 2).all(|i| (v[i] - v[v.len() - 1 - i]).abs() < 1e-12)
        };
        sym(&self.synthesis_low) && sym(&self.synthesis_high)
    }

    /// Squared norm of the synthesis basis for a coefficient reached through `path`
    /// (finest stage first).
    pub fn energy_gain(&self, path: &[Branch]) -> f64 {
        let r = self.equivalent_response(path, true);
        r.values.iter().map(|v| v * v).sum::<f64>() * r.extrapolation
    }

    /// Sum of absolute values of the equivalent analysis filter for `path`.
    pub fn bibo_gain(&self, path: &[Branch]) -> f64 {
        let r = self.equivalent_response(path, false);
        r.values.iter().map(|v| v.abs()).sum::<f64>() * r.extrapolation.sqrt()
    }

    fn equivalent_response(&self, path: &[Branch], synthesis: bool) -> Response {
        let stages: Vec<Branch> = path.iter().copied().filter(|b| b.is_split()).collect();
        let (explicit, extra) = if stages.len() > MAX_EXPLICIT_STAGES {
            stages.split_at(stages.len() - MAX_EXPLICIT_STAGES)
        } else {
            (&stages[..0], &stages[..])
        };

        // Deepest stage is applied first when synthesising.
        let mut values = vec![1.0];
        for branch in extra.iter().rev() {
            let taps = self.taps(*branch, synthesis);
            values = convolve(&upsample(&values), taps);
        }

        // Every skipped coarse low-pass stage roughly doubles the energy.
        let mut extrapolation = 1.0;
        for branch in explicit {
            let taps = self.taps(*branch, synthesis);
            let dc: f64 = taps.iter().sum();
            extrapolation *= if branch.is_high() { 1.0 } else { dc * dc / 2.0 };
        }
        Response {
            values,
            extrapolation,
        }
    }

    fn taps(&self, branch: Branch, synthesis: bool) -> &[f64] {
        match (branch, synthesis) {
            (Branch::High, true) => &self.synthesis_high,
            (_, true) => &self.synthesis_low,
            (Branch::High, false) => &self.analysis_high,
            (_, false) => &self.analysis_low,
        }
    }
}

struct Response {
    values: Vec<f64>,
    extrapolation: f64,
}

fn upsample(v: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; 2 * v.len() - 1];
    for (i, &x) in v.iter().enumerate() {
        out[2 * i] = x;
    }
    out
}

fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &x) in a.iter().enumerate() {
        if x == 0.0 {
            continue;
        }
        for (j, &y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}
