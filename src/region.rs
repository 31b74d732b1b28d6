use crate::rect::Rect;

/// Set of pixels on the integer grid, kept as y-sorted horizontal bands of
/// disjoint x-intervals. Two regions covering the same pixels always compare
/// equal, regardless of which rects they were built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    bands: Vec<Band>,
}

/// One horizontal strip `top..bottom` with sorted, disjoint, non-touching
/// x-intervals (half-open).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Band {
    top: i32,
    bottom: i32,
    spans: Vec<(i32, i32)>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        Self {
            bands: vec![Band {
                top: rect.y,
                bottom: rect.bottom(),
                spans: vec![(rect.x, rect.right())],
            }],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn union_rect(&mut self, rect: Rect) {
        *self = combine(self, &Region::from_rect(rect), |a, b| a | b);
    }

    pub fn subtract(&mut self, other: &Region) {
        *self = combine(self, other, |a, b| a & !b);
    }

    pub fn intersect_rect(&mut self, clip: Rect) {
        *self = combine(self, &Region::from_rect(clip), |a, b| a & b);
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for band in &mut self.bands {
            band.top += dy;
            band.bottom += dy;
            for span in &mut band.spans {
                span.0 += dx;
                span.1 += dx;
            }
        }
    }

    /// Smallest rect enclosing the region.
    pub fn clipbox(&self) -> Option<Rect> {
        let first = self.bands.first()?;
        let last = self.bands.last()?;
        let mut left = i32::MAX;
        let mut right = i32::MIN;
        for band in &self.bands {
            left = left.min(band.spans[0].0);
            right = right.max(band.spans[band.spans.len() - 1].1);
        }
        Some(Rect::new(left, first.top, right - left, last.bottom - first.top))
    }

    /// The region as disjoint rects, top-to-bottom, left-to-right.
    pub fn rects(&self) -> impl Iterator<Item = Rect> + '_ {
        self.bands.iter().flat_map(|band| {
            band.spans
                .iter()
                .map(move |&(x0, x1)| Rect::new(x0, band.top, x1 - x0, band.bottom - band.top))
        })
    }

    #[cfg(test)]
    fn contains_pixel(&self, x: i32, y: i32) -> bool {
        self.bands
            .iter()
            .any(|b| y >= b.top && y < b.bottom && b.spans.iter().any(|&(x0, x1)| x >= x0 && x < x1))
    }
}

/// Re-band both operands over their merged y-breakpoints and apply `keep` to
/// per-pixel membership, span by span. Output bands are coalesced back.
fn combine(a: &Region, b: &Region, keep: fn(bool, bool) -> bool) -> Region {
    let mut ys: Vec<i32> = Vec::with_capacity(2 * (a.bands.len() + b.bands.len()));
    for band in a.bands.iter().chain(&b.bands) {
        ys.push(band.top);
        ys.push(band.bottom);
    }
    ys.sort_unstable();
    ys.dedup();

    let mut out = Region::new();
    for pair in ys.windows(2) {
        let (top, bottom) = (pair[0], pair[1]);
        let sa = band_spans(a, top);
        let sb = band_spans(b, top);
        let spans = combine_spans(sa, sb, keep);
        if spans.is_empty() {
            continue;
        }
        // merge with the previous band when it lines up exactly
        if let Some(prev) = out.bands.last_mut() {
            if prev.bottom == top && prev.spans == spans {
                prev.bottom = bottom;
                continue;
            }
        }
        out.bands.push(Band { top, bottom, spans });
    }
    out
}

fn band_spans(region: &Region, y: i32) -> &[(i32, i32)] {
    match region.bands.iter().find(|b| y >= b.top && y < b.bottom) {
        Some(band) => &band.spans,
        None => &[],
    }
}

fn combine_spans(a: &[(i32, i32)], b: &[(i32, i32)], keep: fn(bool, bool) -> bool) -> Vec<(i32, i32)> {
    let mut xs: Vec<i32> = Vec::with_capacity(2 * (a.len() + b.len()));
    for &(x0, x1) in a.iter().chain(b) {
        xs.push(x0);
        xs.push(x1);
    }
    xs.sort_unstable();
    xs.dedup();

    let covers = |spans: &[(i32, i32)], x: i32| spans.iter().any(|&(x0, x1)| x >= x0 && x < x1);
    let mut out: Vec<(i32, i32)> = Vec::new();
    for pair in xs.windows(2) {
        let (x0, x1) = (pair[0], pair[1]);
        if !keep(covers(a, x0), covers(b, x0)) {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.1 == x0 => last.1 = x1,
            _ => out.push((x0, x1)),
        }
    }
    out
}
