//! Inception v3 with its auxiliary classifier
//!
//! Expects 299x299 inputs. During training the auxiliary head, attached after
//! `mixed_6e`, produces a second set of logits.

use burn::{
    module::{Module, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, Dropout, DropoutConfig, Linear, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{batch_norm_with, flatten, linear_head, linear_in_features, linear_param_ids, transform_input};
use super::registry::ArchitectureSpec;
use super::{Architecture, ClassifierOutput, ImageClassifier};
use crate::utils::Result;

#[derive(Module, Debug)]
pub struct BasicConv2d<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> BasicConv2d<B> {
    fn new(
        channels: [usize; 2],
        kernel: [usize; 2],
        stride: usize,
        padding: [usize; 2],
        device: &B::Device,
    ) -> Self {
        Self {
            conv: Conv2dConfig::new(channels, kernel)
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
                .with_bias(false)
                .init(device),
            bn: batch_norm_with(channels[1], 0.001, 0.1, device),
        }
    }

    fn square(channels: [usize; 2], kernel: usize, stride: usize, padding: usize, device: &B::Device) -> Self {
        Self::new(channels, [kernel, kernel], stride, [padding, padding], device)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.bn.forward(self.conv.forward(x)))
    }
}

fn avg_pool_3x3() -> AvgPool2d {
    AvgPool2dConfig::new([3, 3])
        .with_strides([1, 1])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init()
}

fn max_pool_3x3_s2() -> MaxPool2d {
    MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init()
}

#[derive(Module, Debug)]
pub struct InceptionA<B: Backend> {
    pub branch1x1: BasicConv2d<B>,
    pub branch5x5_1: BasicConv2d<B>,
    pub branch5x5_2: BasicConv2d<B>,
    pub branch3x3dbl_1: BasicConv2d<B>,
    pub branch3x3dbl_2: BasicConv2d<B>,
    pub branch3x3dbl_3: BasicConv2d<B>,
    pub branch_pool: BasicConv2d<B>,
    pub pool: AvgPool2d,
}

impl<B: Backend> InceptionA<B> {
    fn new(input: usize, pool_features: usize, device: &B::Device) -> Self {
        Self {
            branch1x1: BasicConv2d::square([input, 64], 1, 1, 0, device),
            branch5x5_1: BasicConv2d::square([input, 48], 1, 1, 0, device),
            branch5x5_2: BasicConv2d::square([48, 64], 5, 1, 2, device),
            branch3x3dbl_1: BasicConv2d::square([input, 64], 1, 1, 0, device),
            branch3x3dbl_2: BasicConv2d::square([64, 96], 3, 1, 1, device),
            branch3x3dbl_3: BasicConv2d::square([96, 96], 3, 1, 1, device),
            branch_pool: BasicConv2d::square([input, pool_features], 1, 1, 0, device),
            pool: avg_pool_3x3(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1x1.forward(x.clone());
        let b5 = self.branch5x5_2.forward(self.branch5x5_1.forward(x.clone()));
        let b3 = self.branch3x3dbl_1.forward(x.clone());
        let b3 = self.branch3x3dbl_3.forward(self.branch3x3dbl_2.forward(b3));
        let bp = self.branch_pool.forward(self.pool.forward(x));
        Tensor::cat(vec![b1, b5, b3, bp], 1)
    }
}

#[derive(Module, Debug)]
pub struct InceptionB<B: Backend> {
    pub branch3x3: BasicConv2d<B>,
    pub branch3x3dbl_1: BasicConv2d<B>,
    pub branch3x3dbl_2: BasicConv2d<B>,
    pub branch3x3dbl_3: BasicConv2d<B>,
    pub pool: MaxPool2d,
}

impl<B: Backend> InceptionB<B> {
    fn new(input: usize, device: &B::Device) -> Self {
        Self {
            branch3x3: BasicConv2d::square([input, 384], 3, 2, 0, device),
            branch3x3dbl_1: BasicConv2d::square([input, 64], 1, 1, 0, device),
            branch3x3dbl_2: BasicConv2d::square([64, 96], 3, 1, 1, device),
            branch3x3dbl_3: BasicConv2d::square([96, 96], 3, 2, 0, device),
            pool: max_pool_3x3_s2(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b3 = self.branch3x3.forward(x.clone());
        let bd = self.branch3x3dbl_1.forward(x.clone());
        let bd = self.branch3x3dbl_3.forward(self.branch3x3dbl_2.forward(bd));
        let bp = self.pool.forward(x);
        Tensor::cat(vec![b3, bd, bp], 1)
    }
}

#[derive(Module, Debug)]
pub struct InceptionC<B: Backend> {
    pub branch1x1: BasicConv2d<B>,
    pub branch7x7_1: BasicConv2d<B>,
    pub branch7x7_2: BasicConv2d<B>,
    pub branch7x7_3: BasicConv2d<B>,
    pub branch7x7dbl_1: BasicConv2d<B>,
    pub branch7x7dbl_2: BasicConv2d<B>,
    pub branch7x7dbl_3: BasicConv2d<B>,
    pub branch7x7dbl_4: BasicConv2d<B>,
    pub branch7x7dbl_5: BasicConv2d<B>,
    pub branch_pool: BasicConv2d<B>,
    pub pool: AvgPool2d,
}

impl<B: Backend> InceptionC<B> {
    fn new(input: usize, c7: usize, device: &B::Device) -> Self {
        let row = |channels, device| BasicConv2d::new(channels, [1, 7], 1, [0, 3], device);
        let col = |channels, device| BasicConv2d::new(channels, [7, 1], 1, [3, 0], device);
        Self {
            branch1x1: BasicConv2d::square([input, 192], 1, 1, 0, device),
            branch7x7_1: BasicConv2d::square([input, c7], 1, 1, 0, device),
            branch7x7_2: row([c7, c7], device),
            branch7x7_3: col([c7, 192], device),
            branch7x7dbl_1: BasicConv2d::square([input, c7], 1, 1, 0, device),
            branch7x7dbl_2: col([c7, c7], device),
            branch7x7dbl_3: row([c7, c7], device),
            branch7x7dbl_4: col([c7, c7], device),
            branch7x7dbl_5: row([c7, 192], device),
            branch_pool: BasicConv2d::square([input, 192], 1, 1, 0, device),
            pool: avg_pool_3x3(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1x1.forward(x.clone());

        let b7 = self.branch7x7_1.forward(x.clone());
        let b7 = self.branch7x7_3.forward(self.branch7x7_2.forward(b7));

        let bd = self.branch7x7dbl_1.forward(x.clone());
        let bd = self.branch7x7dbl_2.forward(bd);
        let bd = self.branch7x7dbl_3.forward(bd);
        let bd = self.branch7x7dbl_4.forward(bd);
        let bd = self.branch7x7dbl_5.forward(bd);

        let bp = self.branch_pool.forward(self.pool.forward(x));
        Tensor::cat(vec![b1, b7, bd, bp], 1)
    }
}

#[derive(Module, Debug)]
pub struct InceptionD<B: Backend> {
    pub branch3x3_1: BasicConv2d<B>,
    pub branch3x3_2: BasicConv2d<B>,
    pub branch7x7x3_1: BasicConv2d<B>,
    pub branch7x7x3_2: BasicConv2d<B>,
    pub branch7x7x3_3: BasicConv2d<B>,
    pub branch7x7x3_4: BasicConv2d<B>,
    pub pool: MaxPool2d,
}

impl<B: Backend> InceptionD<B> {
    fn new(input: usize, device: &B::Device) -> Self {
        Self {
            branch3x3_1: BasicConv2d::square([input, 192], 1, 1, 0, device),
            branch3x3_2: BasicConv2d::square([192, 320], 3, 2, 0, device),
            branch7x7x3_1: BasicConv2d::square([input, 192], 1, 1, 0, device),
            branch7x7x3_2: BasicConv2d::new([192, 192], [1, 7], 1, [0, 3], device),
            branch7x7x3_3: BasicConv2d::new([192, 192], [7, 1], 1, [3, 0], device),
            branch7x7x3_4: BasicConv2d::square([192, 192], 3, 2, 0, device),
            pool: max_pool_3x3_s2(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b3 = self.branch3x3_2.forward(self.branch3x3_1.forward(x.clone()));
        let b7 = self.branch7x7x3_1.forward(x.clone());
        let b7 = self.branch7x7x3_2.forward(b7);
        let b7 = self.branch7x7x3_3.forward(b7);
        let b7 = self.branch7x7x3_4.forward(b7);
        let bp = self.pool.forward(x);
        Tensor::cat(vec![b3, b7, bp], 1)
    }
}

#[derive(Module, Debug)]
pub struct InceptionE<B: Backend> {
    pub branch1x1: BasicConv2d<B>,
    pub branch3x3_1: BasicConv2d<B>,
    pub branch3x3_2a: BasicConv2d<B>,
    pub branch3x3_2b: BasicConv2d<B>,
    pub branch3x3dbl_1: BasicConv2d<B>,
    pub branch3x3dbl_2: BasicConv2d<B>,
    pub branch3x3dbl_3a: BasicConv2d<B>,
    pub branch3x3dbl_3b: BasicConv2d<B>,
    pub branch_pool: BasicConv2d<B>,
    pub pool: AvgPool2d,
}

impl<B: Backend> InceptionE<B> {
    fn new(input: usize, device: &B::Device) -> Self {
        Self {
            branch1x1: BasicConv2d::square([input, 320], 1, 1, 0, device),
            branch3x3_1: BasicConv2d::square([input, 384], 1, 1, 0, device),
            branch3x3_2a: BasicConv2d::new([384, 384], [1, 3], 1, [0, 1], device),
            branch3x3_2b: BasicConv2d::new([384, 384], [3, 1], 1, [1, 0], device),
            branch3x3dbl_1: BasicConv2d::square([input, 448], 1, 1, 0, device),
            branch3x3dbl_2: BasicConv2d::square([448, 384], 3, 1, 1, device),
            branch3x3dbl_3a: BasicConv2d::new([384, 384], [1, 3], 1, [0, 1], device),
            branch3x3dbl_3b: BasicConv2d::new([384, 384], [3, 1], 1, [1, 0], device),
            branch_pool: BasicConv2d::square([input, 192], 1, 1, 0, device),
            pool: avg_pool_3x3(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1x1.forward(x.clone());

        let b3 = self.branch3x3_1.forward(x.clone());
        let b3 = Tensor::cat(
            vec![self.branch3x3_2a.forward(b3.clone()), self.branch3x3_2b.forward(b3)],
            1,
        );

        let bd = self.branch3x3dbl_2.forward(self.branch3x3dbl_1.forward(x.clone()));
        let bd = Tensor::cat(
            vec![self.branch3x3dbl_3a.forward(bd.clone()), self.branch3x3dbl_3b.forward(bd)],
            1,
        );

        let bp = self.branch_pool.forward(self.pool.forward(x));
        Tensor::cat(vec![b1, b3, bd, bp], 1)
    }
}

#[derive(Module, Debug)]
pub struct InceptionAux<B: Backend> {
    pub pool: AvgPool2d,
    pub conv0: BasicConv2d<B>,
    pub conv1: BasicConv2d<B>,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
}

impl<B: Backend> InceptionAux<B> {
    fn new(input: usize, num_classes: usize, device: &B::Device) -> Self {
        Self {
            pool: AvgPool2dConfig::new([5, 5]).with_strides([3, 3]).init(),
            conv0: BasicConv2d::square([input, 128], 1, 1, 0, device),
            conv1: BasicConv2d::square([128, 768], 5, 1, 0, device),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: linear_head(768, num_classes, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(self.conv0.forward(self.pool.forward(x)));
        self.fc.forward(flatten(self.avgpool.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct InceptionV3<B: Backend> {
    pub conv2d_1a_3x3: BasicConv2d<B>,
    pub conv2d_2a_3x3: BasicConv2d<B>,
    pub conv2d_2b_3x3: BasicConv2d<B>,
    pub conv2d_3b_1x1: BasicConv2d<B>,
    pub conv2d_4a_3x3: BasicConv2d<B>,
    pub mixed_5b: InceptionA<B>,
    pub mixed_5c: InceptionA<B>,
    pub mixed_5d: InceptionA<B>,
    pub mixed_6a: InceptionB<B>,
    pub mixed_6b: InceptionC<B>,
    pub mixed_6c: InceptionC<B>,
    pub mixed_6d: InceptionC<B>,
    pub mixed_6e: InceptionC<B>,
    pub aux_logits: InceptionAux<B>,
    pub mixed_7a: InceptionD<B>,
    pub mixed_7b: InceptionE<B>,
    pub mixed_7c: InceptionE<B>,
    pub maxpool: MaxPool2d,
    pub avgpool: AdaptiveAvgPool2d,
    pub dropout: Dropout,
    pub fc: Linear<B>,
    transform_input: bool,
}

impl<B: Backend> InceptionV3<B> {
    pub fn new(num_classes: usize, transform_input: bool, device: &B::Device) -> Self {
        Self {
            conv2d_1a_3x3: BasicConv2d::square([3, 32], 3, 2, 0, device),
            conv2d_2a_3x3: BasicConv2d::square([32, 32], 3, 1, 0, device),
            conv2d_2b_3x3: BasicConv2d::square([32, 64], 3, 1, 1, device),
            conv2d_3b_1x1: BasicConv2d::square([64, 80], 1, 1, 0, device),
            conv2d_4a_3x3: BasicConv2d::square([80, 192], 3, 1, 0, device),
            mixed_5b: InceptionA::new(192, 32, device),
            mixed_5c: InceptionA::new(256, 64, device),
            mixed_5d: InceptionA::new(288, 64, device),
            mixed_6a: InceptionB::new(288, device),
            mixed_6b: InceptionC::new(768, 128, device),
            mixed_6c: InceptionC::new(768, 160, device),
            mixed_6d: InceptionC::new(768, 160, device),
            mixed_6e: InceptionC::new(768, 192, device),
            aux_logits: InceptionAux::new(768, num_classes, device),
            mixed_7a: InceptionD::new(768, device),
            mixed_7b: InceptionE::new(1280, device),
            mixed_7c: InceptionE::new(2048, device),
            maxpool: max_pool_3x3_s2(),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(0.5).init(),
            fc: linear_head(2048, num_classes, device),
            transform_input,
        }
    }

    /// Everything up to and including `mixed_6e`
    fn stem(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.transform_input {
            transform_input(images)
        } else {
            images
        };
        let x = self.conv2d_1a_3x3.forward(x);
        let x = self.conv2d_2a_3x3.forward(x);
        let x = self.maxpool.forward(self.conv2d_2b_3x3.forward(x));
        let x = self.conv2d_3b_1x1.forward(x);
        let x = self.maxpool.forward(self.conv2d_4a_3x3.forward(x));

        let x = self.mixed_5d.forward(self.mixed_5c.forward(self.mixed_5b.forward(x)));
        let x = self.mixed_6a.forward(x);
        let x = self.mixed_6b.forward(x);
        let x = self.mixed_6c.forward(x);
        let x = self.mixed_6d.forward(x);
        self.mixed_6e.forward(x)
    }

    fn head(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.mixed_7a.forward(x);
        let x = self.mixed_7c.forward(self.mixed_7b.forward(x));
        let x = self.dropout.forward(flatten(self.avgpool.forward(x)));
        self.fc.forward(x)
    }
}

impl<B: Backend> ImageClassifier<B> for InceptionV3<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head(self.stem(images))
    }

    fn forward_train(&self, images: Tensor<B, 4>) -> ClassifierOutput<B> {
        let features = self.stem(images);
        let aux = self.aux_logits.forward(features.clone());
        ClassifierOutput {
            logits: self.head(features),
            aux_logits: Some(aux),
        }
    }

    fn num_classes(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        let mut ids = linear_param_ids(&self.fc);
        ids.extend(linear_param_ids(&self.aux_logits.fc));
        ids
    }
}

impl<B: Backend> Architecture<B> for InceptionV3<B> {
    fn build(_spec: &ArchitectureSpec, num_classes: usize, pretrained: bool, device: &B::Device) -> Result<Self> {
        Ok(Self::new(num_classes, pretrained, device))
    }

    /// Both the primary and the auxiliary classifier are resized
    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc = linear_head(linear_in_features(&self.fc), num_classes, device);
        self.aux_logits.fc = linear_head(linear_in_features(&self.aux_logits.fc), num_classes, device);
        self
    }

    fn key_remaps(_spec: &ArchitectureSpec) -> Vec<(String, String)> {
        vec![
            (r"^Conv2d_(\w+?)\.".into(), "conv2d_${1}.".into()),
            (r"^Mixed_(\w+?)\.".into(), "mixed_${1}.".into()),
            (r"^AuxLogits\.".into(), "aux_logits.".into()),
        ]
    }
}
