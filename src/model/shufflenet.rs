//! ShuffleNet V2 (x0.5 and x1.0)

use burn::{
    module::{Module, ParamId},
    nn::{
        conv::Conv2d,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, Linear, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{batch_norm, conv2d, conv2d_grouped, linear_head, linear_in_features, linear_param_ids};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::{FinetuneError, Result};

const STAGE_REPEATS: [usize; 3] = [4, 8, 4];

fn stage_channels(name: &str) -> Result<[usize; 5]> {
    match name {
        "shufflenet_v2_x0_5" => Ok([24, 48, 96, 192, 1024]),
        "shufflenet_v2_x1_0" => Ok([24, 116, 232, 464, 1024]),
        other => Err(FinetuneError::Model(format!("'{}' is not a ShuffleNetV2 variant", other))),
    }
}

/// Downsampling path, present only in stride-2 units
#[derive(Module, Debug)]
pub struct Branch1<B: Backend> {
    pub dw: Conv2d<B>,
    pub dw_bn: BatchNorm<B>,
    pub pw: Conv2d<B>,
    pub pw_bn: BatchNorm<B>,
}

#[derive(Module, Debug)]
pub struct Branch2<B: Backend> {
    pub pw1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub dw: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub pw2: Conv2d<B>,
    pub bn3: BatchNorm<B>,
}

#[derive(Module, Debug)]
pub struct ShuffleUnit<B: Backend> {
    pub branch1: Option<Branch1<B>>,
    pub branch2: Branch2<B>,
}

impl<B: Backend> ShuffleUnit<B> {
    fn new(input: usize, output: usize, stride: usize, device: &B::Device) -> Self {
        let branch = output / 2;
        let branch1 = (stride > 1).then(|| Branch1 {
            dw: conv2d_grouped([input, input], 3, stride, 1, input, device),
            dw_bn: batch_norm(input, device),
            pw: conv2d([input, branch], 1, 1, 0, device),
            pw_bn: batch_norm(branch, device),
        });
        let branch2_in = if stride > 1 { input } else { branch };

        Self {
            branch1,
            branch2: Branch2 {
                pw1: conv2d([branch2_in, branch], 1, 1, 0, device),
                bn1: batch_norm(branch, device),
                dw: conv2d_grouped([branch, branch], 3, stride, 1, branch, device),
                bn2: batch_norm(branch, device),
                pw2: conv2d([branch, branch], 1, 1, 0, device),
                bn3: batch_norm(branch, device),
            },
        }
    }

    fn branch2(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b = &self.branch2;
        let x = relu(b.bn1.forward(b.pw1.forward(x)));
        let x = b.bn2.forward(b.dw.forward(x));
        relu(b.bn3.forward(b.pw2.forward(x)))
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.branch1 {
            Some(b) => {
                let left = b.dw_bn.forward(b.dw.forward(x.clone()));
                let left = relu(b.pw_bn.forward(b.pw.forward(left)));
                Tensor::cat(vec![left, self.branch2(x)], 1)
            }
            None => {
                let half = x.dims()[1] / 2;
                let left = x.clone().narrow(1, 0, half);
                let right = x.narrow(1, half, half);
                Tensor::cat(vec![left, self.branch2(right)], 1)
            }
        };
        channel_shuffle(out, 2)
    }
}

fn channel_shuffle<B: Backend>(x: Tensor<B, 4>, groups: usize) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    x.reshape([batch, groups, channels / groups, height, width])
        .swap_dims(1, 2)
        .reshape([batch, channels, height, width])
}

#[derive(Module, Debug)]
pub struct ShuffleNetV2<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub maxpool: MaxPool2d,
    pub stage2: Vec<ShuffleUnit<B>>,
    pub stage3: Vec<ShuffleUnit<B>>,
    pub stage4: Vec<ShuffleUnit<B>>,
    pub conv5: Conv2d<B>,
    pub bn5: BatchNorm<B>,
    pub fc: Linear<B>,
}

impl<B: Backend> ShuffleNetV2<B> {
    pub fn new(channels: [usize; 5], num_classes: usize, device: &B::Device) -> Self {
        let stage = |input: usize, output: usize, repeats: usize| -> Vec<ShuffleUnit<B>> {
            (0..repeats)
                .map(|i| {
                    if i == 0 {
                        ShuffleUnit::new(input, output, 2, device)
                    } else {
                        ShuffleUnit::new(output, output, 1, device)
                    }
                })
                .collect()
        };

        Self {
            conv1: conv2d([3, channels[0]], 3, 2, 1, device),
            bn1: batch_norm(channels[0], device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            stage2: stage(channels[0], channels[1], STAGE_REPEATS[0]),
            stage3: stage(channels[1], channels[2], STAGE_REPEATS[1]),
            stage4: stage(channels[2], channels[3], STAGE_REPEATS[2]),
            conv5: conv2d([channels[3], channels[4]], 1, 1, 0, device),
            bn5: batch_norm(channels[4], device),
            fc: linear_head(channels[4], num_classes, device),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for ShuffleNetV2<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let x = self.maxpool.forward(x);
        let x = self
            .stage2
            .iter()
            .chain(&self.stage3)
            .chain(&self.stage4)
            .fold(x, |x, unit| unit.forward(x));
        let x = relu(self.bn5.forward(self.conv5.forward(x)));
        let x = x.mean_dim(3).mean_dim(2).flatten(1, 3);
        self.fc.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        linear_param_ids(&self.fc)
    }
}

impl<B: Backend> Architecture<B> for ShuffleNetV2<B> {
    fn build(spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> Result<Self> {
        Ok(Self::new(stage_channels(spec.name)?, num_classes, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc = linear_head(linear_in_features(&self.fc), num_classes, device);
        self
    }

    fn key_remaps(_spec: &ArchitectureSpec) -> Vec<(String, String)> {
        [
            (r"^conv1\.0\.", "conv1."),
            (r"^conv1\.1\.", "bn1."),
            (r"^conv5\.0\.", "conv5."),
            (r"^conv5\.1\.", "bn5."),
            (r"\.branch1\.0\.", ".branch1.dw."),
            (r"\.branch1\.1\.", ".branch1.dw_bn."),
            (r"\.branch1\.2\.", ".branch1.pw."),
            (r"\.branch1\.3\.", ".branch1.pw_bn."),
            (r"\.branch2\.0\.", ".branch2.pw1."),
            (r"\.branch2\.1\.", ".branch2.bn1."),
            (r"\.branch2\.3\.", ".branch2.dw."),
            (r"\.branch2\.4\.", ".branch2.bn2."),
            (r"\.branch2\.5\.", ".branch2.pw2."),
            (r"\.branch2\.6\.", ".branch2.bn3."),
        ]
        .into_iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_channel_shuffle_interleaves() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 2.0, 3.0], &device).reshape([1, 4, 1, 1]);
        let values: Vec<f32> = channel_shuffle(x, 2).into_data().to_vec().unwrap();
        assert_eq!(values, vec![0.0, 2.0, 1.0, 3.0]);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = ShuffleNetV2::<TestBackend>::new(stage_channels("shufflenet_v2_x0_5").unwrap(), 3, &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        assert_eq!(model.forward(x).dims(), [2, 3]);
        assert!(model.stage2[0].branch1.is_some());
        assert!(model.stage2[1].branch1.is_none());
    }
}
