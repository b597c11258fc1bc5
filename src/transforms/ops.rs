//! Transform operations
//!
//! Every operation works on a [`Sample`], which is either a decoded image or a
//! CHW float tensor. Image operations must come before `ToTensor`, tensor
//! operations after it.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::utils::{FinetuneError, Result};

/// ImageNet channel means
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A CHW float image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    /// Convert an 8-bit image into `[0, 1]` floats, one plane per channel
    pub fn from_image(img: &DynamicImage) -> Self {
        let (width, height) = img.dimensions();
        let (width, height) = (width as usize, height as usize);
        let plane = width * height;

        if img.color().has_color() {
            let rgb = img.to_rgb8();
            let mut data = vec![0.0f32; 3 * plane];
            for (x, y, pixel) in rgb.enumerate_pixels() {
                let offset = y as usize * width + x as usize;
                for c in 0..3 {
                    data[c * plane + offset] = pixel[c] as f32 / 255.0;
                }
            }
            Self { data, channels: 3, height, width }
        } else {
            let data = img.to_luma8().pixels().map(|p| p[0] as f32 / 255.0).collect();
            Self { data, channels: 1, height, width }
        }
    }
}

/// What flows through a pipeline
#[derive(Debug, Clone)]
pub enum Sample {
    Image(DynamicImage),
    Tensor(ImageTensor),
}

impl Sample {
    fn expect_image(self, op: &str) -> Result<DynamicImage> {
        match self {
            Sample::Image(img) => Ok(img),
            Sample::Tensor(_) => Err(FinetuneError::Transform(format!(
                "{} expects an image but received a tensor; place it before ToTensor",
                op
            ))),
        }
    }

    fn expect_tensor(self, op: &str) -> Result<ImageTensor> {
        match self {
            Sample::Tensor(t) => Ok(t),
            Sample::Image(_) => Err(FinetuneError::Transform(format!(
                "{} expects a tensor but received an image; place it after ToTensor",
                op
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Parameter shapes shared by several operations
// ----------------------------------------------------------------------------

/// `224` (edge) or `[h, w]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SizeParam {
    Edge(u32),
    Exact([u32; 2]),
}

impl SizeParam {
    /// `(height, width)` for crops, where an edge means a square
    pub fn square(&self) -> (u32, u32) {
        match *self {
            SizeParam::Edge(s) => (s, s),
            SizeParam::Exact([h, w]) => (h, w),
        }
    }

    fn validate(&self, op: &str) -> Result<()> {
        let (h, w) = self.square();
        if h == 0 || w == 0 {
            return Err(FinetuneError::Transform(format!("{}: size must be positive", op)));
        }
        Ok(())
    }
}

/// `v` meaning `[-v, v]` (or `[1 - v, 1 + v]` for jitter factors), or an explicit `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RangeParam {
    Symmetric(f64),
    Range([f64; 2]),
}

impl RangeParam {
    fn around(&self, center: f64, floor: Option<f64>) -> [f64; 2] {
        match *self {
            RangeParam::Symmetric(v) => {
                let lo = center - v.abs();
                [floor.map_or(lo, |f| lo.max(f)), center + v.abs()]
            }
            RangeParam::Range(r) => r,
        }
    }
}

/// Fill colour for padding and rotation
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FillParam {
    Gray(u8),
    Rgb([u8; 3]),
}

impl Default for FillParam {
    fn default() -> Self {
        FillParam::Gray(0)
    }
}

impl FillParam {
    fn rgb(&self) -> Rgb<u8> {
        match *self {
            FillParam::Gray(v) => Rgb([v, v, v]),
            FillParam::Rgb(c) => Rgb(c),
        }
    }
}

/// `p` (all sides), `[left_right, top_bottom]` or `[left, top, right, bottom]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PaddingParam {
    All(u32),
    Sides(Vec<u32>),
}

impl PaddingParam {
    /// `[left, top, right, bottom]`
    fn ltrb(&self) -> Result<[u32; 4]> {
        match self {
            PaddingParam::All(p) => Ok([*p; 4]),
            PaddingParam::Sides(v) => match v.as_slice() {
                [a, b] => Ok([*a, *b, *a, *b]),
                [l, t, r, b] => Ok([*l, *t, *r, *b]),
                _ => Err(FinetuneError::Transform(format!(
                    "padding must have 1, 2 or 4 values, got {}",
                    v.len()
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingMode {
    #[default]
    Constant,
    Edge,
    Reflect,
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos,
}

impl Interpolation {
    fn filter(&self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Bilinear => FilterType::Triangle,
            Interpolation::Bicubic => FilterType::CatmullRom,
            Interpolation::Lanczos => FilterType::Lanczos3,
        }
    }
}

// ----------------------------------------------------------------------------
// Operation parameters
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resize {
    pub size: SizeParam,
    #[serde(default)]
    pub interpolation: Interpolation,
    #[serde(default)]
    pub max_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CenterCrop {
    pub size: SizeParam,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandomCrop {
    pub size: SizeParam,
    #[serde(default)]
    pub padding: Option<PaddingParam>,
    #[serde(default)]
    pub pad_if_needed: bool,
    #[serde(default)]
    pub fill: FillParam,
    #[serde(default)]
    pub padding_mode: PaddingMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandomResizedCrop {
    pub size: SizeParam,
    #[serde(default = "default_crop_scale")]
    pub scale: [f64; 2],
    #[serde(default = "default_crop_ratio")]
    pub ratio: [f64; 2],
    #[serde(default)]
    pub interpolation: Interpolation,
}

fn default_crop_scale() -> [f64; 2] {
    [0.08, 1.0]
}

fn default_crop_ratio() -> [f64; 2] {
    [3.0 / 4.0, 4.0 / 3.0]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Flip {
    #[serde(default = "default_half")]
    pub p: f64,
}

fn default_half() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandomRotation {
    pub degrees: RangeParam,
    #[serde(default = "nearest")]
    pub interpolation: Interpolation,
    #[serde(default)]
    pub fill: FillParam,
}

fn nearest() -> Interpolation {
    Interpolation::Nearest
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColorJitter {
    #[serde(default)]
    pub brightness: Option<RangeParam>,
    #[serde(default)]
    pub contrast: Option<RangeParam>,
    #[serde(default)]
    pub saturation: Option<RangeParam>,
    #[serde(default)]
    pub hue: Option<RangeParam>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grayscale {
    #[serde(default = "one")]
    pub num_output_channels: u8,
}

fn one() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandomGrayscale {
    #[serde(default = "default_gray_p")]
    pub p: f64,
}

fn default_gray_p() -> f64 {
    0.1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pad {
    pub padding: PaddingParam,
    #[serde(default)]
    pub fill: FillParam,
    #[serde(default)]
    pub padding_mode: PaddingMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GaussianBlur {
    pub kernel_size: u32,
    #[serde(default = "default_sigma")]
    pub sigma: RangeParam,
}

fn default_sigma() -> RangeParam {
    RangeParam::Range([0.1, 2.0])
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    #[serde(default)]
    pub inplace: bool,
}

impl Normalize {
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
            inplace: false,
        }
    }
}

/// Value used to fill erased regions
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EraseValue {
    Constant(f32),
    PerChannel(Vec<f32>),
    /// Only `"random"` is accepted
    Named(String),
}

impl Default for EraseValue {
    fn default() -> Self {
        EraseValue::Constant(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandomErasing {
    #[serde(default = "default_half")]
    pub p: f64,
    #[serde(default = "default_erase_scale")]
    pub scale: [f64; 2],
    #[serde(default = "default_erase_ratio")]
    pub ratio: [f64; 2],
    #[serde(default)]
    pub value: EraseValue,
    #[serde(default)]
    pub inplace: bool,
}

fn default_erase_scale() -> [f64; 2] {
    [0.02, 0.33]
}

fn default_erase_ratio() -> [f64; 2] {
    [0.3, 3.3]
}

/// A resolved transform step
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Resize(Resize),
    CenterCrop(CenterCrop),
    RandomCrop(RandomCrop),
    RandomResizedCrop(RandomResizedCrop),
    RandomHorizontalFlip(Flip),
    RandomVerticalFlip(Flip),
    RandomRotation(RandomRotation),
    ColorJitter(ColorJitter),
    Grayscale(Grayscale),
    RandomGrayscale(RandomGrayscale),
    Pad(Pad),
    GaussianBlur(GaussianBlur),
    ToTensor,
    Normalize(Normalize),
    RandomErasing(RandomErasing),
    Compose(Vec<Transform>),
    RandomApply { transforms: Vec<Transform>, p: f64 },
    RandomChoice { transforms: Vec<Transform>, weights: Option<Vec<f64>> },
    RandomOrder(Vec<Transform>),
}

impl Transform {
    /// Check parameter values that deserialization alone cannot catch
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(FinetuneError::Transform(msg));
        match self {
            Transform::Resize(r) => r.size.validate("Resize"),
            Transform::CenterCrop(c) => c.size.validate("CenterCrop"),
            Transform::RandomCrop(c) => {
                c.size.validate("RandomCrop")?;
                if let Some(p) = &c.padding {
                    p.ltrb()?;
                }
                Ok(())
            }
            Transform::RandomResizedCrop(c) => {
                c.size.validate("RandomResizedCrop")?;
                if c.scale[0] > c.scale[1] || c.ratio[0] > c.ratio[1] || c.ratio[0] <= 0.0 {
                    return err("RandomResizedCrop: scale and ratio must be ordered [min, max] with positive ratio".into());
                }
                Ok(())
            }
            Transform::RandomHorizontalFlip(f) | Transform::RandomVerticalFlip(f) => {
                check_probability(f.p)
            }
            Transform::RandomGrayscale(g) => check_probability(g.p),
            Transform::Grayscale(g) if g.num_output_channels != 1 && g.num_output_channels != 3 => {
                err("Grayscale: num_output_channels must be 1 or 3".into())
            }
            Transform::Pad(p) => p.padding.ltrb().map(|_| ()),
            Transform::GaussianBlur(b) if b.kernel_size == 0 || b.kernel_size % 2 == 0 => {
                err("GaussianBlur: kernel_size must be a positive odd number".into())
            }
            Transform::Normalize(n) => {
                if n.mean.is_empty() || n.mean.len() != n.std.len() {
                    return err("Normalize: mean and std must be non-empty and the same length".into());
                }
                if n.std.iter().any(|s| *s == 0.0) {
                    return err("Normalize: std must not contain zero".into());
                }
                Ok(())
            }
            Transform::RandomErasing(e) => {
                check_probability(e.p)?;
                if let EraseValue::Named(name) = &e.value {
                    if name != "random" {
                        return err(format!("RandomErasing: unknown value '{}'", name));
                    }
                }
                Ok(())
            }
            Transform::RandomApply { p, .. } => check_probability(*p),
            Transform::RandomChoice { transforms, weights } => match weights {
                Some(w) if w.len() != transforms.len() => {
                    err("RandomChoice: p must have one weight per transform".into())
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Apply this step to a sample
    pub fn apply(&self, sample: Sample, rng: &mut ChaCha8Rng) -> Result<Sample> {
        match self {
            Transform::Resize(op) => Ok(Sample::Image(resize(&sample.expect_image("Resize")?, op))),
            Transform::CenterCrop(op) => {
                let img = sample.expect_image("CenterCrop")?;
                let (h, w) = op.size.square();
                Ok(Sample::Image(center_crop(&img, h, w)))
            }
            Transform::RandomCrop(op) => {
                random_crop(sample.expect_image("RandomCrop")?, op, rng).map(Sample::Image)
            }
            Transform::RandomResizedCrop(op) => Ok(Sample::Image(random_resized_crop(
                &sample.expect_image("RandomResizedCrop")?,
                op,
                rng,
            ))),
            Transform::RandomHorizontalFlip(op) => {
                let img = sample.expect_image("RandomHorizontalFlip")?;
                Ok(Sample::Image(if rng.gen::<f64>() < op.p { img.fliph() } else { img }))
            }
            Transform::RandomVerticalFlip(op) => {
                let img = sample.expect_image("RandomVerticalFlip")?;
                Ok(Sample::Image(if rng.gen::<f64>() < op.p { img.flipv() } else { img }))
            }
            Transform::RandomRotation(op) => {
                let img = sample.expect_image("RandomRotation")?;
                let [lo, hi] = op.degrees.around(0.0, None);
                let angle = uniform(rng, lo, hi);
                Ok(Sample::Image(rotate(&img, angle as f32, op.interpolation, op.fill.rgb())))
            }
            Transform::ColorJitter(op) => {
                Ok(Sample::Image(color_jitter(sample.expect_image("ColorJitter")?, op, rng)))
            }
            Transform::Grayscale(op) => {
                Ok(Sample::Image(grayscale(&sample.expect_image("Grayscale")?, op.num_output_channels)))
            }
            Transform::RandomGrayscale(op) => {
                let img = sample.expect_image("RandomGrayscale")?;
                if rng.gen::<f64>() < op.p {
                    let channels = if img.color().has_color() { 3 } else { 1 };
                    Ok(Sample::Image(grayscale(&img, channels)))
                } else {
                    Ok(Sample::Image(img))
                }
            }
            Transform::Pad(op) => {
                let img = sample.expect_image("Pad")?;
                Ok(Sample::Image(pad(&img, op.padding.ltrb()?, op.fill.rgb(), op.padding_mode)))
            }
            Transform::GaussianBlur(op) => {
                let img = sample.expect_image("GaussianBlur")?;
                let [lo, hi] = op.sigma.around(0.0, Some(0.0));
                let sigma = uniform(rng, lo, hi) as f32;
                Ok(Sample::Image(img.blur(sigma)))
            }
            Transform::ToTensor => {
                let img = sample.expect_image("ToTensor")?;
                Ok(Sample::Tensor(ImageTensor::from_image(&img)))
            }
            Transform::Normalize(op) => {
                normalize(sample.expect_tensor("Normalize")?, op).map(Sample::Tensor)
            }
            Transform::RandomErasing(op) => {
                random_erasing(sample.expect_tensor("RandomErasing")?, op, rng).map(Sample::Tensor)
            }
            Transform::Compose(steps) => steps.iter().try_fold(sample, |s, t| t.apply(s, rng)),
            Transform::RandomApply { transforms, p } => {
                if rng.gen::<f64>() < *p {
                    transforms.iter().try_fold(sample, |s, t| t.apply(s, rng))
                } else {
                    Ok(sample)
                }
            }
            Transform::RandomChoice { transforms, weights } => {
                if transforms.is_empty() {
                    return Ok(sample);
                }
                let idx = match weights {
                    Some(w) => weighted_index(w, rng),
                    None => rng.gen_range(0..transforms.len()),
                };
                transforms[idx].apply(sample, rng)
            }
            Transform::RandomOrder(steps) => {
                let mut order: Vec<usize> = (0..steps.len()).collect();
                order.shuffle(rng);
                order.into_iter().try_fold(sample, |s, i| steps[i].apply(s, rng))
            }
        }
    }
}

fn check_probability(p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(FinetuneError::Transform(format!("probability {} is outside [0, 1]", p)))
    }
}

/// Uniform sample from `[lo, hi)`, tolerating an empty range
fn uniform(rng: &mut ChaCha8Rng, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

fn weighted_index(weights: &[f64], rng: &mut ChaCha8Rng) -> usize {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let mut target = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        if target < *w {
            return i;
        }
        target -= w;
    }
    weights.len() - 1
}

// ----------------------------------------------------------------------------
// Geometry
// ----------------------------------------------------------------------------

fn resize(img: &DynamicImage, op: &Resize) -> DynamicImage {
    let (w, h) = img.dimensions();
    let (new_h, new_w) = match op.size {
        SizeParam::Exact([th, tw]) => (th, tw),
        SizeParam::Edge(size) => {
            let (short, long) = if w <= h { (w, h) } else { (h, w) };
            let mut new_short = size;
            let mut new_long = ((size as u64 * long as u64) / short.max(1) as u64) as u32;
            if let Some(max) = op.max_size {
                if new_long > max {
                    new_short = ((max as u64 * new_short as u64) / new_long as u64) as u32;
                    new_long = max;
                }
            }
            if w <= h {
                (new_long, new_short)
            } else {
                (new_short, new_long)
            }
        }
    };
    img.resize_exact(new_w.max(1), new_h.max(1), op.interpolation.filter())
}

/// Center crop, zero-padding first when the crop is larger than the image
pub fn center_crop(img: &DynamicImage, crop_h: u32, crop_w: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    let img = if crop_w > w || crop_h > h {
        let pad_lr = crop_w.saturating_sub(w);
        let pad_tb = crop_h.saturating_sub(h);
        pad(
            img,
            [pad_lr / 2, pad_tb / 2, (pad_lr + 1) / 2, (pad_tb + 1) / 2],
            Rgb([0, 0, 0]),
            PaddingMode::Constant,
        )
    } else {
        img.clone()
    };
    let (w, h) = img.dimensions();
    let top = ((h - crop_h) as f64 / 2.0).round() as u32;
    let left = ((w - crop_w) as f64 / 2.0).round() as u32;
    img.crop_imm(left, top, crop_w, crop_h)
}

fn random_crop(img: DynamicImage, op: &RandomCrop, rng: &mut ChaCha8Rng) -> Result<DynamicImage> {
    let (th, tw) = op.size.square();
    let mut img = match &op.padding {
        Some(p) => pad(&img, p.ltrb()?, op.fill.rgb(), op.padding_mode),
        None => img,
    };

    if op.pad_if_needed {
        let (w, h) = img.dimensions();
        if w < tw || h < th {
            let dw = tw.saturating_sub(w);
            let dh = th.saturating_sub(h);
            img = pad(&img, [dw, dh, dw, dh], op.fill.rgb(), op.padding_mode);
        }
    }

    let (w, h) = img.dimensions();
    if w < tw || h < th {
        return Err(FinetuneError::Transform(format!(
            "RandomCrop: crop {}x{} is larger than image {}x{}",
            th, tw, h, w
        )));
    }
    let top = rng.gen_range(0..=h - th);
    let left = rng.gen_range(0..=w - tw);
    Ok(img.crop_imm(left, top, tw, th))
}

fn random_resized_crop(img: &DynamicImage, op: &RandomResizedCrop, rng: &mut ChaCha8Rng) -> DynamicImage {
    let (width, height) = img.dimensions();
    let area = (width * height) as f64;
    let log_ratio = [op.ratio[0].ln(), op.ratio[1].ln()];

    let mut window = None;
    for _ in 0..10 {
        let target_area = area * uniform(rng, op.scale[0], op.scale[1]);
        let aspect = uniform(rng, log_ratio[0], log_ratio[1]).exp();
        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let top = rng.gen_range(0..=height - h);
            let left = rng.gen_range(0..=width - w);
            window = Some((left, top, w, h));
            break;
        }
    }

    // central crop with the ratio clamped into range
    let (left, top, w, h) = window.unwrap_or_else(|| {
        let in_ratio = width as f64 / height.max(1) as f64;
        let (w, h) = if in_ratio < op.ratio[0] {
            (width, (width as f64 / op.ratio[0]).round() as u32)
        } else if in_ratio > op.ratio[1] {
            ((height as f64 * op.ratio[1]).round() as u32, height)
        } else {
            (width, height)
        };
        let (w, h) = (w.clamp(1, width.max(1)), h.clamp(1, height.max(1)));
        ((width - w) / 2, (height - h) / 2, w, h)
    });

    let (th, tw) = op.size.square();
    img.crop_imm(left, top, w, h)
        .resize_exact(tw, th, op.interpolation.filter())
}

/// Map an out-of-range coordinate back into `[0, n)`
fn wrap_index(i: i64, n: i64, mode: PaddingMode) -> i64 {
    if n <= 1 {
        return 0;
    }
    let mapped = match mode {
        PaddingMode::Constant | PaddingMode::Edge => i,
        PaddingMode::Reflect => {
            let period = 2 * (n - 1);
            let m = i.rem_euclid(period);
            if m < n {
                m
            } else {
                period - m
            }
        }
        PaddingMode::Symmetric => {
            let period = 2 * n;
            let m = i.rem_euclid(period);
            if m < n {
                m
            } else {
                period - 1 - m
            }
        }
    };
    mapped.clamp(0, n - 1)
}

fn pad(img: &DynamicImage, [left, top, right, bottom]: [u32; 4], fill: Rgb<u8>, mode: PaddingMode) -> DynamicImage {
    map_rgb(img, |rgb| {
        let (w, h) = rgb.dimensions();
        let out_w = w + left + right;
        let out_h = h + top + bottom;
        ImageBuffer::from_fn(out_w, out_h, |x, y| {
            let sx = x as i64 - left as i64;
            let sy = y as i64 - top as i64;
            let inside = sx >= 0 && sy >= 0 && sx < w as i64 && sy < h as i64;
            if inside {
                *rgb.get_pixel(sx as u32, sy as u32)
            } else if mode == PaddingMode::Constant || w == 0 || h == 0 {
                fill
            } else {
                let px = wrap_index(sx, w as i64, mode) as u32;
                let py = wrap_index(sy, h as i64, mode) as u32;
                *rgb.get_pixel(px, py)
            }
        })
    })
}

fn rotate(img: &DynamicImage, angle_degrees: f32, interpolation: Interpolation, fill: Rgb<u8>) -> DynamicImage {
    if angle_degrees.abs() < 1e-3 {
        return img.clone();
    }

    let angle_rad = angle_degrees.to_radians();
    let (cos_a, sin_a) = (angle_rad.cos(), angle_rad.sin());

    map_rgb(img, |rgb| {
        let (width, height) = rgb.dimensions();
        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;

        ImageBuffer::from_fn(width, height, |x, y| {
            // inverse mapping; positive angles turn the content counter-clockwise
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let src_x = cx + dx * cos_a - dy * sin_a;
            let src_y = cy + dx * sin_a + dy * cos_a;

            match interpolation {
                Interpolation::Nearest => {
                    let (sx, sy) = (src_x.round(), src_y.round());
                    if sx < 0.0 || sy < 0.0 || sx > width as f32 - 1.0 || sy > height as f32 - 1.0 {
                        fill
                    } else {
                        *rgb.get_pixel(sx as u32, sy as u32)
                    }
                }
                _ => bilinear_sample(&rgb, src_x, src_y, fill),
            }
        })
    })
}

/// Bilinear interpolation, `fill` outside the image
fn bilinear_sample(img: &RgbImage, x: f32, y: f32, fill: Rgb<u8>) -> Rgb<u8> {
    let (width, height) = img.dimensions();

    if x < 0.0 || y < 0.0 || x > width as f32 - 1.0 || y > height as f32 - 1.0 {
        return fill;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

// ----------------------------------------------------------------------------
// Colour
// ----------------------------------------------------------------------------

/// Run `f` on an RGB copy, returning grayscale again if the input had no colour
fn map_rgb(img: &DynamicImage, f: impl FnOnce(RgbImage) -> RgbImage) -> DynamicImage {
    let gray = !img.color().has_color();
    let out = DynamicImage::ImageRgb8(f(img.to_rgb8()));
    if gray {
        DynamicImage::ImageLuma8(out.to_luma8())
    } else {
        out
    }
}

fn luminance(p: &Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

fn grayscale(img: &DynamicImage, channels: u8) -> DynamicImage {
    let gray = img.grayscale();
    if channels == 3 {
        DynamicImage::ImageRgb8(gray.to_rgb8())
    } else {
        DynamicImage::ImageLuma8(gray.to_luma8())
    }
}

fn color_jitter(img: DynamicImage, op: &ColorJitter, rng: &mut ChaCha8Rng) -> DynamicImage {
    let mut order = [0usize, 1, 2, 3];
    order.shuffle(rng);

    let mut img = img;
    for step in order {
        img = match step {
            0 => match op.brightness {
                Some(b) => {
                    let [lo, hi] = b.around(1.0, Some(0.0));
                    adjust_brightness(&img, uniform(rng, lo, hi) as f32)
                }
                None => img,
            },
            1 => match op.contrast {
                Some(c) => {
                    let [lo, hi] = c.around(1.0, Some(0.0));
                    adjust_contrast(&img, uniform(rng, lo, hi) as f32)
                }
                None => img,
            },
            2 => match op.saturation {
                Some(s) => {
                    let [lo, hi] = s.around(1.0, Some(0.0));
                    adjust_saturation(&img, uniform(rng, lo, hi) as f32)
                }
                None => img,
            },
            _ => match op.hue {
                Some(h) => {
                    let [lo, hi] = h.around(0.0, None);
                    let shift = uniform(rng, lo.max(-0.5), hi.min(0.5));
                    img.huerotate((shift * 360.0).round() as i32)
                }
                None => img,
            },
        };
    }
    img
}

/// Scale every channel by `factor`
fn adjust_brightness(img: &DynamicImage, factor: f32) -> DynamicImage {
    map_rgb(img, |mut rgb| {
        for pixel in rgb.pixels_mut() {
            for c in 0..3 {
                pixel[c] = (pixel[c] as f32 * factor).round().clamp(0.0, 255.0) as u8;
            }
        }
        rgb
    })
}

/// Blend with the mean luminance
fn adjust_contrast(img: &DynamicImage, factor: f32) -> DynamicImage {
    map_rgb(img, |mut rgb| {
        let count = (rgb.width() as f64 * rgb.height() as f64).max(1.0);
        let mean = (rgb.pixels().map(|p| luminance(p) as f64).sum::<f64>() / count) as f32;

        for pixel in rgb.pixels_mut() {
            for c in 0..3 {
                pixel[c] = (mean + factor * (pixel[c] as f32 - mean)).round().clamp(0.0, 255.0) as u8;
            }
        }
        rgb
    })
}

/// Blend each pixel with its own grayscale value
fn adjust_saturation(img: &DynamicImage, factor: f32) -> DynamicImage {
    map_rgb(img, |mut rgb| {
        for pixel in rgb.pixels_mut() {
            let gray = luminance(pixel);
            for c in 0..3 {
                pixel[c] = (gray + factor * (pixel[c] as f32 - gray)).round().clamp(0.0, 255.0) as u8;
            }
        }
        rgb
    })
}

// ----------------------------------------------------------------------------
// Tensor stage
// ----------------------------------------------------------------------------

fn normalize(mut tensor: ImageTensor, op: &Normalize) -> Result<ImageTensor> {
    let channels = tensor.channels;
    let pick = |v: &[f32], c: usize| if v.len() == 1 { v[0] } else { v[c] };
    if op.mean.len() != 1 && op.mean.len() != channels {
        return Err(FinetuneError::Transform(format!(
            "Normalize: {} mean values for a {}-channel tensor",
            op.mean.len(),
            channels
        )));
    }

    let plane = tensor.height * tensor.width;
    for c in 0..channels {
        let (mean, std) = (pick(&op.mean, c), pick(&op.std, c));
        for v in &mut tensor.data[c * plane..(c + 1) * plane] {
            *v = (*v - mean) / std;
        }
    }
    Ok(tensor)
}

fn random_erasing(mut tensor: ImageTensor, op: &RandomErasing, rng: &mut ChaCha8Rng) -> Result<ImageTensor> {
    if rng.gen::<f64>() >= op.p {
        return Ok(tensor);
    }

    let (channels, height, width) = (tensor.channels, tensor.height, tensor.width);
    if let EraseValue::PerChannel(v) = &op.value {
        if v.len() != channels && v.len() != 1 {
            return Err(FinetuneError::Transform(format!(
                "RandomErasing: {} values for a {}-channel tensor",
                v.len(),
                channels
            )));
        }
    }

    let area = (height * width) as f64;
    let log_ratio = [op.ratio[0].ln(), op.ratio[1].ln()];

    for _ in 0..10 {
        let erase_area = area * uniform(rng, op.scale[0], op.scale[1]);
        let aspect = uniform(rng, log_ratio[0], log_ratio[1]).exp();
        let eh = (erase_area * aspect).sqrt().round() as usize;
        let ew = (erase_area / aspect).sqrt().round() as usize;
        if eh == 0 || ew == 0 || eh >= height || ew >= width {
            continue;
        }

        let top = rng.gen_range(0..=height - eh);
        let left = rng.gen_range(0..=width - ew);
        let plane = height * width;
        for c in 0..channels {
            for y in top..top + eh {
                for x in left..left + ew {
                    let v = match &op.value {
                        EraseValue::Constant(v) => *v,
                        EraseValue::PerChannel(v) => if v.len() == 1 { v[0] } else { v[c] },
                        EraseValue::Named(_) => standard_normal(rng),
                    };
                    tensor.data[c * plane + y * width + x] = v;
                }
            }
        }
        break;
    }
    Ok(tensor)
}

/// Box-Muller
fn standard_normal(rng: &mut ChaCha8Rng) -> f32 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w.max(1)) as u8, (y * 255 / h.max(1)) as u8, 128])
        }))
    }

    fn image_of(sample: Sample) -> DynamicImage {
        match sample {
            Sample::Image(img) => img,
            Sample::Tensor(_) => panic!("expected image"),
        }
    }

    fn tensor_of(sample: Sample) -> ImageTensor {
        match sample {
            Sample::Tensor(t) => t,
            Sample::Image(_) => panic!("expected tensor"),
        }
    }

    #[test]
    fn test_resize_edge_keeps_aspect() {
        let op = Transform::Resize(Resize {
            size: SizeParam::Edge(32),
            interpolation: Interpolation::Bilinear,
            max_size: None,
        });
        let out = image_of(op.apply(Sample::Image(gradient(100, 50)), &mut rng()).unwrap());
        assert_eq!(out.dimensions(), (64, 32));
    }

    #[test]
    fn test_center_crop_and_pad_when_small() {
        let out = center_crop(&gradient(40, 30), 20, 10);
        assert_eq!(out.dimensions(), (10, 20));

        let padded = center_crop(&gradient(4, 4), 8, 8);
        assert_eq!(padded.dimensions(), (8, 8));
        assert_eq!(padded.to_rgb8().get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_random_resized_crop_output_size() {
        let op: RandomResizedCrop = serde_json::from_str(r#"{"size": 24}"#).unwrap();
        let t = Transform::RandomResizedCrop(op);
        for _ in 0..5 {
            let out = image_of(t.apply(Sample::Image(gradient(60, 40)), &mut rng()).unwrap());
            assert_eq!(out.dimensions(), (24, 24));
        }
    }

    #[test]
    fn test_random_crop_too_large_errors() {
        let op: RandomCrop = serde_json::from_str(r#"{"size": [50, 50]}"#).unwrap();
        let result = Transform::RandomCrop(op).apply(Sample::Image(gradient(20, 20)), &mut rng());
        assert!(result.is_err());

        let op: RandomCrop = serde_json::from_str(r#"{"size": 30, "pad_if_needed": true}"#).unwrap();
        let out = image_of(Transform::RandomCrop(op).apply(Sample::Image(gradient(20, 20)), &mut rng()).unwrap());
        assert_eq!(out.dimensions(), (30, 30));
    }

    #[test]
    fn test_flip_probability_one_flips() {
        let img = gradient(8, 4);
        let op = Transform::RandomHorizontalFlip(Flip { p: 1.0 });
        let out = image_of(op.apply(Sample::Image(img.clone()), &mut rng()).unwrap()).to_rgb8();
        assert_eq!(out.get_pixel(0, 0), img.to_rgb8().get_pixel(7, 0));
    }

    #[test]
    fn test_pad_modes() {
        let img = gradient(4, 4);
        let reflect = pad(&img, [2, 0, 0, 0], Rgb([0, 0, 0]), PaddingMode::Reflect).to_rgb8();
        let src = img.to_rgb8();
        assert_eq!(reflect.dimensions(), (6, 4));
        // reflect excludes the edge pixel: column 0 mirrors source column 2
        assert_eq!(reflect.get_pixel(0, 0), src.get_pixel(2, 0));

        let symmetric = pad(&img, [2, 0, 0, 0], Rgb([0, 0, 0]), PaddingMode::Symmetric).to_rgb8();
        assert_eq!(symmetric.get_pixel(0, 0), src.get_pixel(1, 0));

        let constant = pad(&img, [1, 1, 1, 1], Rgb([9, 9, 9]), PaddingMode::Constant).to_rgb8();
        assert_eq!(constant.get_pixel(0, 0), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_to_tensor_and_normalize() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(2, 2, Rgb([255, 0, 51])));
        let tensor = ImageTensor::from_image(&img);
        assert_eq!(tensor.shape(), [3, 2, 2]);
        assert!((tensor.data[0] - 1.0).abs() < 1e-6);
        assert!((tensor.data[8] - 0.2).abs() < 1e-6);

        let op = Normalize { mean: vec![0.5], std: vec![0.5], inplace: false };
        let normed = normalize(tensor, &op).unwrap();
        assert!((normed.data[0] - 1.0).abs() < 1e-6);
        assert!((normed.data[4] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_grayscale_channels() {
        let gray1 = ImageTensor::from_image(&grayscale(&gradient(4, 4), 1));
        assert_eq!(gray1.channels, 1);
        let gray3 = ImageTensor::from_image(&grayscale(&gradient(4, 4), 3));
        assert_eq!(gray3.channels, 3);
    }

    #[test]
    fn test_stage_mismatch_is_error() {
        let normalize = Transform::Normalize(Normalize::imagenet());
        assert!(normalize.apply(Sample::Image(gradient(4, 4)), &mut rng()).is_err());

        let tensor = Sample::Tensor(ImageTensor::from_image(&gradient(4, 4)));
        let flip = Transform::RandomVerticalFlip(Flip { p: 0.5 });
        assert!(flip.apply(tensor, &mut rng()).is_err());
    }

    #[test]
    fn test_random_erasing_constant_fill() {
        let tensor = ImageTensor {
            data: vec![1.0; 3 * 32 * 32],
            channels: 3,
            height: 32,
            width: 32,
        };
        let op: RandomErasing = serde_json::from_str(r#"{"p": 1.0, "value": 0.0}"#).unwrap();
        let out = tensor_of(Transform::RandomErasing(op).apply(Sample::Tensor(tensor), &mut rng()).unwrap());
        let erased = out.data.iter().filter(|v| **v == 0.0).count();
        assert!(erased > 0);
        assert_eq!(erased % 3, 0);
    }

    #[test]
    fn test_same_seed_same_augmentation() {
        let pipeline = Transform::Compose(vec![
            Transform::RandomResizedCrop(serde_json::from_str(r#"{"size": 16}"#).unwrap()),
            Transform::ColorJitter(serde_json::from_str(r#"{"brightness": 0.4, "hue": 0.1}"#).unwrap()),
            Transform::RandomRotation(serde_json::from_str(r#"{"degrees": 30}"#).unwrap()),
            Transform::ToTensor,
        ]);
        let a = tensor_of(pipeline.apply(Sample::Image(gradient(40, 40)), &mut rng()).unwrap());
        let b = tensor_of(pipeline.apply(Sample::Image(gradient(40, 40)), &mut rng()).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: std::result::Result<Resize, _> = serde_json::from_str(r#"{"size": 8, "antialias": true}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Transform::RandomHorizontalFlip(Flip { p: 1.5 }).validate().is_err());
        let bad_norm = Normalize { mean: vec![0.5, 0.5], std: vec![0.5], inplace: false };
        assert!(Transform::Normalize(bad_norm).validate().is_err());
        let blur = GaussianBlur { kernel_size: 4, sigma: RangeParam::Symmetric(1.0) };
        assert!(Transform::GaussianBlur(blur).validate().is_err());
    }

    #[test]
    fn test_weighted_index_skips_zero_weights() {
        let mut r = rng();
        for _ in 0..20 {
            assert_eq!(weighted_index(&[0.0, 1.0, 0.0], &mut r), 1);
        }
    }
}
