//! MnasNet (depth multipliers 0.5 and 1.0)

use burn::{
    module::{Module, ParamId},
    nn::{conv::Conv2d, BatchNorm, Dropout, DropoutConfig, Linear},
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{
    batch_norm_with, conv2d, conv2d_grouped, linear_head, linear_in_features, linear_param_ids, BN_EPS,
};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::{FinetuneError, Result};

/// Running-stat momentum of the TensorFlow reference (1 - 0.9997)
const BN_MOMENTUM: f64 = 0.0003;

const BASE_DEPTHS: [usize; 8] = [32, 16, 24, 40, 80, 96, 192, 320];

/// Stacks as `(kernel, stride, expansion, repeats)`, producing depths 2..=7
const STACKS: [(usize, usize, usize, usize); 6] = [
    (3, 2, 3, 3),
    (5, 2, 3, 3),
    (5, 2, 6, 3),
    (3, 1, 6, 2),
    (5, 2, 6, 4),
    (3, 1, 6, 1),
];

/// Index of the first stack inside torchvision's `layers` sequential
const FIRST_STACK_INDEX: usize = 8;

/// Round to a multiple of 8, bumping up when rounding down loses more than 10%
fn round_to_multiple_of(value: f64, divisor: usize) -> usize {
    let rounded = ((value + divisor as f64 / 2.0) as usize / divisor * divisor).max(divisor);
    if rounded as f64 >= 0.9 * value {
        rounded
    } else {
        rounded + divisor
    }
}

pub fn depths(alpha: f64) -> [usize; 8] {
    BASE_DEPTHS.map(|depth| round_to_multiple_of(depth as f64 * alpha, 8))
}

fn parse_alpha(name: &str) -> Result<f64> {
    match name {
        "mnasnet0_5" => Ok(0.5),
        "mnasnet1_0" => Ok(1.0),
        other => Err(FinetuneError::Model(format!("'{}' is not a MnasNet variant", other))),
    }
}

fn bn<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B> {
    batch_norm_with(channels, BN_EPS, BN_MOMENTUM, device)
}

#[derive(Module, Debug)]
pub struct MnasBlock<B: Backend> {
    pub expand: Conv2d<B>,
    pub expand_bn: BatchNorm<B>,
    pub depthwise: Conv2d<B>,
    pub depthwise_bn: BatchNorm<B>,
    pub project: Conv2d<B>,
    pub project_bn: BatchNorm<B>,
    residual: bool,
}

impl<B: Backend> MnasBlock<B> {
    fn new(input: usize, output: usize, kernel: usize, stride: usize, expansion: usize, device: &B::Device) -> Self {
        let mid = input * expansion;
        Self {
            expand: conv2d([input, mid], 1, 1, 0, device),
            expand_bn: bn(mid, device),
            depthwise: conv2d_grouped([mid, mid], kernel, stride, kernel / 2, mid, device),
            depthwise_bn: bn(mid, device),
            project: conv2d([mid, output], 1, 1, 0, device),
            project_bn: bn(output, device),
            residual: input == output && stride == 1,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = relu(self.expand_bn.forward(self.expand.forward(x.clone())));
        let out = relu(self.depthwise_bn.forward(self.depthwise.forward(out)));
        let out = self.project_bn.forward(self.project.forward(out));
        if self.residual {
            out + x
        } else {
            out
        }
    }
}

#[derive(Module, Debug)]
pub struct MnasNet<B: Backend> {
    pub stem_conv: Conv2d<B>,
    pub stem_bn: BatchNorm<B>,
    pub dw_conv: Conv2d<B>,
    pub dw_bn: BatchNorm<B>,
    pub pw_conv: Conv2d<B>,
    pub pw_bn: BatchNorm<B>,
    pub stacks: Vec<Vec<MnasBlock<B>>>,
    pub head_conv: Conv2d<B>,
    pub head_bn: BatchNorm<B>,
    pub dropout: Dropout,
    pub classifier: Linear<B>,
}

impl<B: Backend> MnasNet<B> {
    pub fn new(alpha: f64, num_classes: usize, device: &B::Device) -> Self {
        let d = depths(alpha);

        let stacks = STACKS
            .iter()
            .enumerate()
            .map(|(i, &(kernel, stride, expansion, repeats))| {
                let (input, output) = (d[i + 1], d[i + 2]);
                (0..repeats)
                    .map(|r| {
                        if r == 0 {
                            MnasBlock::new(input, output, kernel, stride, expansion, device)
                        } else {
                            MnasBlock::new(output, output, kernel, 1, expansion, device)
                        }
                    })
                    .collect()
            })
            .collect();

        Self {
            stem_conv: conv2d([3, d[0]], 3, 2, 1, device),
            stem_bn: bn(d[0], device),
            dw_conv: conv2d_grouped([d[0], d[0]], 3, 1, 1, d[0], device),
            dw_bn: bn(d[0], device),
            pw_conv: conv2d([d[0], d[1]], 1, 1, 0, device),
            pw_bn: bn(d[1], device),
            stacks,
            head_conv: conv2d([d[7], 1280], 1, 1, 0, device),
            head_bn: bn(1280, device),
            dropout: DropoutConfig::new(0.2).init(),
            classifier: linear_head(1280, num_classes, device),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for MnasNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.stem_bn.forward(self.stem_conv.forward(images)));
        let x = relu(self.dw_bn.forward(self.dw_conv.forward(x)));
        let x = self.pw_bn.forward(self.pw_conv.forward(x));
        let x = self.stacks.iter().flatten().fold(x, |x, block| block.forward(x));
        let x = relu(self.head_bn.forward(self.head_conv.forward(x)));
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

impl<B: Backend> Architecture<B> for MnasNet<B> {
    fn build(spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> Result<Self> {
        Ok(Self::new(parse_alpha(spec.name)?, num_classes, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.classifier = linear_head(linear_in_features(&self.classifier), num_classes, device);
        self
    }

    fn key_remaps(_spec: &ArchitectureSpec) -> Vec<(String, String)> {
        let mut remaps: Vec<(String, String)> = [
            (0, "stem_conv"),
            (1, "stem_bn"),
            (3, "dw_conv"),
            (4, "dw_bn"),
            (6, "pw_conv"),
            (7, "pw_bn"),
            (14, "head_conv"),
            (15, "head_bn"),
        ]
        .iter()
        .map(|(index, field)| (format!(r"^layers\.{}\.", index), format!("{}.", field)))
        .collect();

        let block_fields = ["expand", "expand_bn", "", "depthwise", "depthwise_bn", "", "project", "project_bn"];
        for stack in 0..STACKS.len() {
            for (index, field) in block_fields.iter().enumerate().filter(|(_, f)| !f.is_empty()) {
                remaps.push((
                    format!(r"^layers\.{}\.(\d+)\.layers\.{}\.", FIRST_STACK_INDEX + stack, index),
                    format!("stacks.{}.${{1}}.{}.", stack, field),
                ));
            }
        }

        remaps.push((r"^classifier\.1\.".into(), "classifier.".into()));
        remaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_depths() {
        assert_eq!(depths(1.0), [32, 16, 24, 40, 80, 96, 192, 320]);
        assert_eq!(depths(0.5), [16, 8, 16, 24, 40, 48, 96, 160]);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = MnasNet::<TestBackend>::new(0.5, 3, &device);
        assert_eq!(model.stacks.iter().map(Vec::len).sum::<usize>(), 16);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        assert_eq!(model.forward(x).dims(), [1, 3]);
    }

    #[test]
    fn test_stack_remap() {
        let spec = crate::model::registry::lookup("mnasnet1_0").unwrap();
        let remaps = <MnasNet<TestBackend> as Architecture<_>>::key_remaps(spec);
        let rename = |key: &str| {
            remaps.iter().fold(key.to_string(), |k, (from, to)| {
                regex::Regex::new(from).unwrap().replace_all(&k, to.as_str()).to_string()
            })
        };
        assert_eq!(rename("layers.10.2.layers.3.weight"), "stacks.2.2.depthwise.weight");
        assert_eq!(rename("layers.1.running_var"), "stem_bn.running_var");
        assert_eq!(rename("layers.14.weight"), "head_conv.weight");
    }
}
