//! Template matching by zero-mean normalized cross-correlation (ZNCC) over RGB.
//!
//! For every placement of the template inside the frame the score is
//!
//! ```text
//!            Σ_c Σ (T_c(i,j) - mean T_c) · (F_c(x+i, y+j) - mean F_c,xy)
//! score = ------------------------------------------------------------------
//!          sqrt( Σ_c Σ (T_c - mean T_c)² · Σ_c Σ (F_c,xy - mean F_c,xy)² )
//! ```
//!
//! The three channels are correlated jointly, so patterns of equal brightness
//! but different hue do not match. Scores lie in `[-1, 1]`; the best placement
//! is the first maximum in row-major order, which keeps results deterministic.
//!
//! The search runs on an image pyramid where each level halves both images by
//! 2x2 averaging. The coarsest level is scanned exhaustively using summed-area
//! tables; the strongest coarse candidates are then refined level by level in a
//! small neighbourhood, ending with exact full-resolution scores. The depth is
//! derived from the template size unless fixed with `with_coarse_levels`;
//! `Some(0)` scans every full-resolution placement.

use image::{Rgb, RgbImage};
use thiserror::Error;
use tracing::trace;

use crate::model::Point;

const CHANNELS: usize = 3;

/// Energy below which a window (or template) is treated as flat. With integer
/// pixels any non-flat patch has an energy of at least 1/2.
const FLAT_EPSILON: f64 = 0.25;

/// Coarse candidates refined down the pyramid.
const DEFAULT_CANDIDATES: usize = 5;

/// Smallest template side kept at the coarsest pyramid level.
const MIN_COARSE_SIDE: u32 = 6;

/// Deepest pyramid chosen when no depth is configured.
pub const MAX_AUTO_LEVELS: u8 = 4;

const MAX_LEVELS: u8 = 8;

/// Placements searched on each side of a candidate projected from the level above.
const REFINE_RADIUS: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("reference image is empty")]
    EmptyTemplate,

    #[error("reference image {template_w}x{template_h} is larger than the frame {frame_w}x{frame_h}")]
    TemplateLargerThanFrame {
        template_w: u32,
        template_h: u32,
        frame_w: u32,
        frame_h: u32,
    },

    #[error("search stopped before completion")]
    Interrupted,
}

/// Best placement of a template inside a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    /// Top-left corner of the best placement.
    pub location: Point,
    pub confidence: f64,
    pub template_width: u32,
    pub template_height: u32,
}

impl MatchOutcome {
    /// Where to act: the center of the matched area.
    pub fn click_point(&self) -> Point {
        self.location
            .center_of(self.template_width, self.template_height)
    }
}

/// Deterministic template matcher.
#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    coarse_levels: Option<u8>,
    candidates: usize,
}

impl Default for TemplateMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateMatcher {
    /// Matcher picking its pyramid depth from the template size.
    pub fn new() -> Self {
        Self {
            coarse_levels: None,
            candidates: DEFAULT_CANDIDATES,
        }
    }

    /// Matcher scoring every full-resolution placement.
    pub fn exhaustive() -> Self {
        Self::new().with_coarse_levels(Some(0))
    }

    /// Fix the pyramid depth (`None` picks it from the template size).
    pub fn with_coarse_levels(mut self, levels: Option<u8>) -> Self {
        self.coarse_levels = levels;
        self
    }

    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates.max(1);
        self
    }

    pub fn coarse_levels(&self) -> Option<u8> {
        self.coarse_levels
    }

    /// Pyramid depth used for a `width`x`height` template. Levels that would
    /// shrink the template below `MIN_COARSE_SIDE` are skipped.
    pub fn levels_for(&self, width: u32, height: u32) -> u8 {
        let cap = self.coarse_levels.unwrap_or(MAX_AUTO_LEVELS).min(MAX_LEVELS);
        let side = width.min(height);
        let mut levels = 0;
        while levels < cap && (side >> (levels + 1)) >= MIN_COARSE_SIDE {
            levels += 1;
        }
        levels
    }

    /// Locate `template` inside `frame`.
    pub fn match_template(
        &self,
        frame: &RgbImage,
        template: &RgbImage,
    ) -> Result<MatchOutcome, MatchError> {
        self.match_until(frame, template, &|| false)
    }

    /// Locate `template` inside `frame`, giving up with `MatchError::Interrupted`
    /// as soon as `stop` returns true. `stop` is polled once per scanned row and
    /// once per refined candidate.
    pub fn match_until(
        &self,
        frame: &RgbImage,
        template: &RgbImage,
        stop: &dyn Fn() -> bool,
    ) -> Result<MatchOutcome, MatchError> {
        let (tw, th) = template.dimensions();
        let (fw, fh) = frame.dimensions();
        if tw == 0 || th == 0 {
            return Err(MatchError::EmptyTemplate);
        }
        if tw > fw || th > fh {
            return Err(MatchError::TemplateLargerThanFrame {
                template_w: tw,
                template_h: th,
                frame_w: fw,
                frame_h: fh,
            });
        }

        let levels = self.levels_for(tw, th);
        let best = if levels == 0 {
            let stats = TemplateStats::new(template);
            let table = SummedArea::new(frame);
            scan(frame, &table, &stats, Window::full(fw, fh, tw, th), stop)?.best
        } else {
            self.pyramid_search(frame, template, levels, stop)?
        };

        trace!(
            target: "clickflow::matcher",
            x = best.x, y = best.y, score = best.score, levels,
            "Best placement"
        );
        Ok(MatchOutcome {
            location: Point::new(best.x as i32, best.y as i32),
            confidence: best.score,
            template_width: tw,
            template_height: th,
        })
    }

    fn pyramid_search(
        &self,
        frame: &RgbImage,
        template: &RgbImage,
        levels: u8,
        stop: &dyn Fn() -> bool,
    ) -> Result<Scored, MatchError> {
        let depth = usize::from(levels);
        let mut frames: Vec<RgbImage> = Vec::with_capacity(depth);
        let mut templates: Vec<RgbImage> = Vec::with_capacity(depth);
        for level in 0..depth {
            if stop() {
                return Err(MatchError::Interrupted);
            }
            frames.push(halve(level_of(frame, &frames, level)));
            templates.push(halve(level_of(template, &templates, level)));
        }
        let stats: Vec<TemplateStats> = (0..=depth)
            .map(|level| TemplateStats::new(level_of(template, &templates, level)))
            .collect();

        let coarse_frame = level_of(frame, &frames, depth);
        let coarse_stats = &stats[depth];
        let coarse = scan(
            coarse_frame,
            &SummedArea::new(coarse_frame),
            coarse_stats,
            Window::full(
                coarse_frame.width(),
                coarse_frame.height(),
                coarse_stats.width,
                coarse_stats.height,
            ),
            stop,
        )?;
        let spacing = coarse_stats.width.max(coarse_stats.height) / 2;
        let peaks = top_candidates(&coarse, self.candidates, spacing);

        let mut best: Option<Scored> = None;
        for peak in peaks {
            let mut at = peak;
            for level in (0..depth).rev() {
                if stop() {
                    return Err(MatchError::Interrupted);
                }
                let image = level_of(frame, &frames, level);
                let level_stats = &stats[level];
                let window = Window::around(
                    at.x * 2,
                    at.y * 2,
                    image.dimensions(),
                    (level_stats.width, level_stats.height),
                );
                at = refine(image, level_stats, window);
            }
            best = Some(match best {
                Some(current) if !at.beats(&current) => current,
                _ => at,
            });
        }

        // `top_candidates` always yields the coarse maximum; this only guards the type.
        Ok(best.unwrap_or(Scored {
            x: (coarse.best.x << levels).min(frame.width() - template.width()),
            y: (coarse.best.y << levels).min(frame.height() - template.height()),
            score: coarse.best.score,
        }))
    }
}

fn level_of<'a>(base: &'a RgbImage, halves: &'a [RgbImage], level: usize) -> &'a RgbImage {
    match level {
        0 => base,
        n => &halves[n - 1],
    }
}

/// Next pyramid level: each pixel averages a 2x2 block, odd edges are dropped.
fn halve(image: &RgbImage) -> RgbImage {
    let (sw, sh) = image.dimensions();
    let raw = image.as_raw();
    let stride = sw as usize * CHANNELS;
    RgbImage::from_fn((sw / 2).max(1), (sh / 2).max(1), |x, y| {
        let x0 = (2 * x).min(sw - 1) as usize;
        let x1 = (2 * x + 1).min(sw - 1) as usize;
        let y0 = (2 * y).min(sh - 1) as usize;
        let y1 = (2 * y + 1).min(sh - 1) as usize;
        let mut px = [0u8; CHANNELS];
        for (c, out) in px.iter_mut().enumerate() {
            let total: u32 = [(x0, y0), (x1, y0), (x0, y1), (x1, y1)]
                .iter()
                .map(|&(xx, yy)| u32::from(raw[yy * stride + xx * CHANNELS + c]))
                .sum();
            *out = ((total + 2) / 4) as u8;
        }
        Rgb(px)
    })
}

/// Zero-mean template values (interleaved RGB) and their joint energy.
struct TemplateStats {
    width: u32,
    height: u32,
    count: f64,
    mean: [f64; CHANNELS],
    centered: Vec<f64>,
    energy: f64,
}

impl TemplateStats {
    fn new(template: &RgbImage) -> Self {
        let raw = template.as_raw();
        let count = f64::from(template.width()) * f64::from(template.height());
        let mut mean = [0.0; CHANNELS];
        for px in raw.chunks_exact(CHANNELS) {
            for (m, &v) in mean.iter_mut().zip(px) {
                *m += f64::from(v);
            }
        }
        for m in &mut mean {
            *m /= count;
        }
        let centered: Vec<f64> = raw
            .iter()
            .enumerate()
            .map(|(i, &v)| f64::from(v) - mean[i % CHANNELS])
            .collect();
        let energy = centered.iter().map(|v| v * v).sum();
        Self {
            width: template.width(),
            height: template.height(),
            count,
            mean,
            centered,
            energy,
        }
    }

    /// ZNCC of a window from its sums and its cross term with the centered template.
    fn score(&self, sums: &WindowSums, cross: f64) -> f64 {
        let variance = sums.variance(self.count);
        if self.energy <= FLAT_EPSILON || variance <= FLAT_EPSILON {
            self.flat_score(sums, variance)
        } else {
            (cross / (self.energy * variance).sqrt()).clamp(-1.0, 1.0)
        }
    }

    /// Score when the template or the window has no variance: identical flat
    /// patches match perfectly, anything else does not correlate.
    fn flat_score(&self, sums: &WindowSums, variance: f64) -> f64 {
        let both_flat = self.energy <= FLAT_EPSILON && variance <= FLAT_EPSILON;
        let same_color = sums
            .sum
            .iter()
            .zip(&self.mean)
            .all(|(s, m)| (s / self.count - m).abs() < 0.5);
        if both_flat && same_color { 1.0 } else { 0.0 }
    }
}

/// Per-channel sums and the joint sum of squares over one window.
#[derive(Debug, Default, Clone, Copy)]
struct WindowSums {
    sum: [f64; CHANNELS],
    sq: f64,
}

impl WindowSums {
    fn variance(&self, count: f64) -> f64 {
        let mean_part: f64 = self.sum.iter().map(|s| s * s).sum::<f64>() / count;
        (self.sq - mean_part).max(0.0)
    }
}

/// Summed-area tables of per-channel values and of squared values.
struct SummedArea {
    stride: usize,
    sum: Vec<[f64; CHANNELS]>,
    sq: Vec<f64>,
}

impl SummedArea {
    fn new(image: &RgbImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![[0.0; CHANNELS]; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        let raw = image.as_raw();
        for y in 0..h {
            let mut row_sum = [0.0; CHANNELS];
            let mut row_sq = 0.0;
            for x in 0..w {
                let px = &raw[(y * w + x) * CHANNELS..(y * w + x + 1) * CHANNELS];
                for (acc, &v) in row_sum.iter_mut().zip(px) {
                    let v = f64::from(v);
                    *acc += v;
                    row_sq += v * v;
                }
                let at = (y + 1) * stride + x + 1;
                let above = sum[at - stride];
                for c in 0..CHANNELS {
                    sum[at][c] = above[c] + row_sum[c];
                }
                sq[at] = sq[at - stride] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> WindowSums {
        let s = self.stride;
        let a = y * s + x;
        let b = y * s + x + w;
        let c = (y + h) * s + x;
        let d = (y + h) * s + x + w;
        let mut sums = WindowSums {
            sq: self.sq[d] - self.sq[b] - self.sq[c] + self.sq[a],
            ..WindowSums::default()
        };
        for ch in 0..CHANNELS {
            sums.sum[ch] =
                self.sum[d][ch] - self.sum[b][ch] - self.sum[c][ch] + self.sum[a][ch];
        }
        sums
    }
}

/// Inclusive range of top-left placements to evaluate.
#[derive(Debug, Clone, Copy)]
struct Window {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl Window {
    fn full(fw: u32, fh: u32, tw: u32, th: u32) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: fw - tw,
            y1: fh - th,
        }
    }

    /// Placements within `REFINE_RADIUS` of (cx, cy), clamped to the frame.
    fn around(cx: u32, cy: u32, (fw, fh): (u32, u32), (tw, th): (u32, u32)) -> Self {
        let (max_x, max_y) = (fw - tw, fh - th);
        Self {
            x0: cx.saturating_sub(REFINE_RADIUS).min(max_x),
            y0: cy.saturating_sub(REFINE_RADIUS).min(max_y),
            x1: (cx + REFINE_RADIUS).min(max_x),
            y1: (cy + REFINE_RADIUS).min(max_y),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    x: u32,
    y: u32,
    score: f64,
}

impl Scored {
    /// Strictly higher score, or equal score earlier in row-major order.
    fn beats(&self, other: &Scored) -> bool {
        self.score > other.score
            || (self.score == other.score && (self.y, self.x) < (other.y, other.x))
    }
}

struct ScoreMap {
    width: u32,
    scores: Vec<f64>,
    origin: (u32, u32),
    best: Scored,
}

/// Centered cross term of the template against the window at (x, y).
fn cross_at(frame: &RgbImage, stats: &TemplateStats, x: usize, y: usize) -> f64 {
    let stride = frame.width() as usize * CHANNELS;
    let row_len = stats.width as usize * CHANNELS;
    let raw = frame.as_raw();
    let mut cross = 0.0;
    for j in 0..stats.height as usize {
        let start = (y + j) * stride + x * CHANNELS;
        let frame_row = &raw[start..start + row_len];
        let tpl_row = &stats.centered[j * row_len..(j + 1) * row_len];
        for (f, t) in frame_row.iter().zip(tpl_row) {
            cross += f64::from(*f) * t;
        }
    }
    cross
}

/// Window sums and cross term in one pass, for windows without a summed-area table.
fn direct_terms(frame: &RgbImage, stats: &TemplateStats, x: usize, y: usize) -> (WindowSums, f64) {
    let stride = frame.width() as usize * CHANNELS;
    let row_len = stats.width as usize * CHANNELS;
    let raw = frame.as_raw();
    let mut sums = WindowSums::default();
    let mut cross = 0.0;
    for j in 0..stats.height as usize {
        let start = (y + j) * stride + x * CHANNELS;
        let frame_row = &raw[start..start + row_len];
        let tpl_row = &stats.centered[j * row_len..(j + 1) * row_len];
        for (i, (f, t)) in frame_row.iter().zip(tpl_row).enumerate() {
            let v = f64::from(*f);
            sums.sum[i % CHANNELS] += v;
            sums.sq += v * v;
            cross += v * t;
        }
    }
    (sums, cross)
}

fn scan(
    frame: &RgbImage,
    table: &SummedArea,
    stats: &TemplateStats,
    window: Window,
    stop: &dyn Fn() -> bool,
) -> Result<ScoreMap, MatchError> {
    let (tw, th) = (stats.width as usize, stats.height as usize);
    let cols = (window.x1 - window.x0 + 1) as usize;
    let rows = (window.y1 - window.y0 + 1) as usize;
    let mut scores = Vec::with_capacity(cols * rows);
    let mut best = Scored {
        x: window.x0,
        y: window.y0,
        score: f64::NEG_INFINITY,
    };

    for y in window.y0..=window.y1 {
        if stop() {
            return Err(MatchError::Interrupted);
        }
        for x in window.x0..=window.x1 {
            let (xs, ys) = (x as usize, y as usize);
            let sums = table.window(xs, ys, tw, th);
            let flat = stats.energy <= FLAT_EPSILON || sums.variance(stats.count) <= FLAT_EPSILON;
            let cross = if flat { 0.0 } else { cross_at(frame, stats, xs, ys) };
            let score = stats.score(&sums, cross);
            scores.push(score);
            if score > best.score {
                best = Scored { x, y, score };
            }
        }
    }

    Ok(ScoreMap {
        width: cols as u32,
        scores,
        origin: (window.x0, window.y0),
        best,
    })
}

/// Best placement inside a small window, scored directly.
fn refine(frame: &RgbImage, stats: &TemplateStats, window: Window) -> Scored {
    let mut best = Scored {
        x: window.x0,
        y: window.y0,
        score: f64::NEG_INFINITY,
    };
    for y in window.y0..=window.y1 {
        for x in window.x0..=window.x1 {
            let (sums, cross) = direct_terms(frame, stats, x as usize, y as usize);
            let score = stats.score(&sums, cross);
            if score > best.score {
                best = Scored { x, y, score };
            }
        }
    }
    best
}

/// Strongest coarse placements, at least `spacing` apart, strongest first.
fn top_candidates(map: &ScoreMap, count: usize, spacing: u32) -> Vec<Scored> {
    let mut all: Vec<Scored> = map
        .scores
        .iter()
        .enumerate()
        .map(|(i, &score)| Scored {
            x: map.origin.0 + i as u32 % map.width,
            y: map.origin.1 + i as u32 / map.width,
            score,
        })
        .collect();
    all.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| (a.y, a.x).cmp(&(b.y, b.x)))
    });

    let mut picked: Vec<Scored> = Vec::with_capacity(count);
    for candidate in all {
        if picked.len() == count {
            break;
        }
        let far = picked.iter().all(|p| {
            p.x.abs_diff(candidate.x) > spacing || p.y.abs_diff(candidate.y) > spacing
        });
        if far {
            picked.push(candidate);
        }
    }
    picked
}

#[cfg(test)]
pub(crate) mod testing {
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Seeded RGB noise.
    pub fn noise(width: u32, height: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        RgbImage::from_fn(width, height, |_, _| Rgb(rng.random::<[u8; 3]>()))
    }

    /// Gray pixel with equal channels.
    pub fn gray(value: u8) -> Rgb<u8> {
        Rgb([value, value, value])
    }

    /// Screen-like frame: smooth colored backdrop with a few flat panels.
    pub fn desktop(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let (fx, fy) = (f64::from(x), f64::from(y));
            let panel = (x / 240 + y / 180) % 4 == 0 && x % 240 > 30 && y % 180 > 40;
            if panel {
                return Rgb([30, 60, 200]);
            }
            let r = 120.0 + 50.0 * (fx / 37.0).sin() * (fy / 23.0).cos();
            let g = 110.0 + 60.0 * (fy / 41.0 + fx / 59.0).sin();
            let b = 128.0
                + 60.0 * (fx / 151.0 + 0.3).sin() * (fy / 97.0).cos()
                + 30.0 * ((fx + fy) / 17.3).sin();
            Rgb([r as u8, g as u8, b as u8])
        })
    }
}
