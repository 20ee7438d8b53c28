/// Transfer sizes visited by a benchmark sweep.
///
/// Starts at `min` and doubles while the size stays within `max`. An empty
/// range (`max < min`) or a zero start yields nothing; doubling past the
/// address space ends the sweep instead of wrapping around.
#[derive(Debug, Clone)]
pub struct Sweep {
    next: Option<u64>,
    max: u64,
}

impl Sweep {
    pub fn new(min: u32, max: u32) -> Self {
        let (min, max) = (u64::from(min), u64::from(max));
        Self {
            next: (min > 0 && min <= max).then_some(min),
            max,
        }
    }
}

impl Iterator for Sweep {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.next?;
        self.next = cur.checked_mul(2).filter(|&n| n <= self.max);
        Some(cur as usize)
    }
}
