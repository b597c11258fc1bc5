//! MobileNet V2

use burn::{
    module::{Module, ParamId},
    nn::{conv::Conv2d, BatchNorm, Dropout, DropoutConfig, Linear},
    tensor::{backend::Backend, Tensor},
};

use super::layers::{batch_norm, conv2d, linear_head, linear_in_features, linear_param_ids, ConvBn};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::Result;

/// Inverted residual settings: expansion t, output channels c, repeats n, first stride s
const SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvBn<B>>,
    pub depthwise: ConvBn<B>,
    pub project: Conv2d<B>,
    pub project_bn: BatchNorm<B>,
    residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(input: usize, output: usize, stride: usize, expand_ratio: usize, device: &B::Device) -> Self {
        let hidden = input * expand_ratio;
        Self {
            expand: (expand_ratio != 1).then(|| ConvBn::new([input, hidden], 1, 1, 1, device)),
            depthwise: ConvBn::new([hidden, hidden], 3, stride, hidden, device),
            project: conv2d([hidden, output], 1, 1, 0, device),
            project_bn: batch_norm(output, device),
            residual: stride == 1 && input == output,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.expand {
            Some(expand) => expand.forward_relu6(x.clone()),
            None => x.clone(),
        };
        let out = self.depthwise.forward_relu6(out);
        let out = self.project_bn.forward(self.project.forward(out));
        if self.residual {
            x + out
        } else {
            out
        }
    }
}

#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub last: ConvBn<B>,
    pub dropout: Dropout,
    pub classifier: Linear<B>,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn new(num_classes: usize, device: &B::Device) -> Self {
        let mut blocks = Vec::new();
        let mut input = STEM_CHANNELS;
        for (t, c, n, s) in SETTINGS {
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                blocks.push(InvertedResidual::new(input, c, stride, t, device));
                input = c;
            }
        }

        Self {
            stem: ConvBn::new([3, STEM_CHANNELS], 3, 2, 1, device),
            blocks,
            last: ConvBn::new([input, LAST_CHANNELS], 1, 1, 1, device),
            dropout: DropoutConfig::new(0.2).init(),
            classifier: linear_head(LAST_CHANNELS, num_classes, device),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for MobileNetV2<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward_relu6(images);
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        let x = self.last.forward_relu6(x);
        let x = x.mean_dim(3).mean_dim(2).flatten(1, 3);
        self.classifier.forward(self.dropout.forward(x))
    }

    fn num_classes(&self) -> usize {
        self.classifier.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        linear_param_ids(&self.classifier)
    }
}

impl<B: Backend> Architecture<B> for MobileNetV2<B> {
    fn build(_spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> Result<Self> {
        Ok(Self::new(num_classes, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.classifier = linear_head(linear_in_features(&self.classifier), num_classes, device);
        self
    }

    /// `features.{i}` is the stem (0), the inverted residuals (1..=17) and
    /// the last 1x1 conv (18); inside a residual, `conv` is a flat sequence
    fn key_remaps(_spec: &ArchitectureSpec) -> Vec<(String, String)> {
        let mut remaps: Vec<(String, String)> = vec![
            (r"^features\.0\.0\.".into(), "stem.conv.".into()),
            (r"^features\.0\.1\.".into(), "stem.bn.".into()),
        ];

        let mut block = 0;
        for (t, _, n, _) in SETTINGS {
            for _ in 0..n {
                let from = |suffix: &str| format!(r"^features\.{}\.conv\.{}", block + 1, suffix);
                let to = |field: &str| format!("blocks.{}.{}", block, field);
                if t != 1 {
                    remaps.push((from(r"0\.0\."), to("expand.conv.")));
                    remaps.push((from(r"0\.1\."), to("expand.bn.")));
                    remaps.push((from(r"1\.0\."), to("depthwise.conv.")));
                    remaps.push((from(r"1\.1\."), to("depthwise.bn.")));
                    remaps.push((from(r"2\."), to("project.")));
                    remaps.push((from(r"3\."), to("project_bn.")));
                } else {
                    remaps.push((from(r"0\.0\."), to("depthwise.conv.")));
                    remaps.push((from(r"0\.1\."), to("depthwise.bn.")));
                    remaps.push((from(r"1\."), to("project.")));
                    remaps.push((from(r"2\."), to("project_bn.")));
                }
                block += 1;
            }
        }

        let last = block + 1;
        remaps.push((format!(r"^features\.{}\.0\.", last), "last.conv.".into()));
        remaps.push((format!(r"^features\.{}\.1\.", last), "last.bn.".into()));
        remaps.push((r"^classifier\.1\.".into(), "classifier.".into()));
        remaps
    }
}
