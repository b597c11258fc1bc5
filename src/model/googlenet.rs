//! GoogLeNet (Inception v1), without the auxiliary classifiers

use burn::{
    module::{Module, ParamId},
    nn::{
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, Dropout, DropoutConfig, Linear, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{
    batch_norm_with, conv2d, flatten, linear_head, linear_in_features, linear_param_ids, pad_for_ceil_mode,
    transform_input,
};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::Result;

/// Conv + BN(eps 0.001) + ReLU, as in torchvision's `BasicConv2d`
#[derive(Module, Debug)]
pub struct BasicConv<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> BasicConv<B> {
    pub fn new(channels: [usize; 2], kernel: usize, stride: usize, padding: usize, device: &B::Device) -> Self {
        Self {
            conv: conv2d(channels, kernel, stride, padding, device),
            bn: batch_norm_with(channels[1], 0.001, 0.1, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.bn.forward(self.conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct InceptionBlock<B: Backend> {
    pub branch1: BasicConv<B>,
    pub branch2_reduce: BasicConv<B>,
    pub branch2: BasicConv<B>,
    pub branch3_reduce: BasicConv<B>,
    pub branch3: BasicConv<B>,
    pub branch4_pool: MaxPool2d,
    pub branch4: BasicConv<B>,
}

impl<B: Backend> InceptionBlock<B> {
    /// `[in, 1x1, 3x3 reduce, 3x3, 5x5 reduce, 5x5, pool proj]`
    fn new(c: [usize; 7], device: &B::Device) -> Self {
        Self {
            branch1: BasicConv::new([c[0], c[1]], 1, 1, 0, device),
            branch2_reduce: BasicConv::new([c[0], c[2]], 1, 1, 0, device),
            branch2: BasicConv::new([c[2], c[3]], 3, 1, 1, device),
            branch3_reduce: BasicConv::new([c[0], c[4]], 1, 1, 0, device),
            // torchvision uses a 3x3 kernel here despite the "5x5" name
            branch3: BasicConv::new([c[4], c[5]], 3, 1, 1, device),
            branch4_pool: MaxPool2dConfig::new([3, 3])
                .with_strides([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            branch4: BasicConv::new([c[0], c[6]], 1, 1, 0, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1.forward(x.clone());
        let b2 = self.branch2.forward(self.branch2_reduce.forward(x.clone()));
        let b3 = self.branch3.forward(self.branch3_reduce.forward(x.clone()));
        let b4 = self.branch4.forward(self.branch4_pool.forward(pad_for_ceil_mode(x, 3, 1, 1)));
        Tensor::cat(vec![b1, b2, b3, b4], 1)
    }
}

#[derive(Module, Debug)]
pub struct GoogLeNet<B: Backend> {
    pub conv1: BasicConv<B>,
    pub conv2: BasicConv<B>,
    pub conv3: BasicConv<B>,
    pub inception3a: InceptionBlock<B>,
    pub inception3b: InceptionBlock<B>,
    pub inception4a: InceptionBlock<B>,
    pub inception4b: InceptionBlock<B>,
    pub inception4c: InceptionBlock<B>,
    pub inception4d: InceptionBlock<B>,
    pub inception4e: InceptionBlock<B>,
    pub inception5a: InceptionBlock<B>,
    pub inception5b: InceptionBlock<B>,
    pub pool3x3: MaxPool2d,
    pub pool2x2: MaxPool2d,
    pub avgpool: AdaptiveAvgPool2d,
    pub dropout: Dropout,
    pub fc: Linear<B>,
    transform_input: bool,
}

impl<B: Backend> GoogLeNet<B> {
    pub fn new(num_classes: usize, transform_input: bool, device: &B::Device) -> Self {
        Self {
            conv1: BasicConv::new([3, 64], 7, 2, 3, device),
            conv2: BasicConv::new([64, 64], 1, 1, 0, device),
            conv3: BasicConv::new([64, 192], 3, 1, 1, device),
            inception3a: InceptionBlock::new([192, 64, 96, 128, 16, 32, 32], device),
            inception3b: InceptionBlock::new([256, 128, 128, 192, 32, 96, 64], device),
            inception4a: InceptionBlock::new([480, 192, 96, 208, 16, 48, 64], device),
            inception4b: InceptionBlock::new([512, 160, 112, 224, 24, 64, 64], device),
            inception4c: InceptionBlock::new([512, 128, 128, 256, 24, 64, 64], device),
            inception4d: InceptionBlock::new([512, 112, 144, 288, 32, 64, 64], device),
            inception4e: InceptionBlock::new([528, 256, 160, 320, 32, 128, 128], device),
            inception5a: InceptionBlock::new([832, 256, 160, 320, 32, 128, 128], device),
            inception5b: InceptionBlock::new([832, 384, 192, 384, 48, 128, 128], device),
            pool3x3: MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init(),
            pool2x2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(0.2).init(),
            fc: linear_head(1024, num_classes, device),
            transform_input,
        }
    }

    fn max_pool(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool3x3.forward(pad_for_ceil_mode(x, 3, 2, 0))
    }
}

impl<B: Backend> ImageClassifier<B> for GoogLeNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = if self.transform_input {
            transform_input(images)
        } else {
            images
        };

        let x = self.max_pool(self.conv1.forward(x));
        let x = self.conv3.forward(self.conv2.forward(x));
        let x = self.max_pool(x);

        let x = self.inception3b.forward(self.inception3a.forward(x));
        let x = self.max_pool(x);

        let x = [
            &self.inception4a,
            &self.inception4b,
            &self.inception4c,
            &self.inception4d,
            &self.inception4e,
        ]
        .into_iter()
        .fold(x, |x, block| block.forward(x));
        let x = self.pool2x2.forward(pad_for_ceil_mode(x, 2, 2, 0));

        let x = self.inception5b.forward(self.inception5a.forward(x));
        let x = self.dropout.forward(flatten(self.avgpool.forward(x)));
        self.fc.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        linear_param_ids(&self.fc)
    }
}

impl<B: Backend> Architecture<B> for GoogLeNet<B> {
    fn build(_spec: &ArchitectureSpec, num_classes: usize, pretrained: bool, device: &B::Device) -> Result<Self> {
        Ok(Self::new(num_classes, pretrained, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc = linear_head(linear_in_features(&self.fc), num_classes, device);
        self
    }

    fn key_remaps(_spec: &ArchitectureSpec) -> Vec<(String, String)> {
        vec![
            (r"\.branch([23])\.0\.".into(), ".branch${1}_reduce.".into()),
            (r"\.branch([23])\.1\.".into(), ".branch${1}.".into()),
            (r"\.branch4\.1\.".into(), ".branch4.".into()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = GoogLeNet::<TestBackend>::new(6, true, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        assert_eq!(model.forward(x).dims(), [1, 6]);
    }

    #[test]
    fn test_branch_remaps() {
        let spec = crate::model::registry::lookup("googlenet").unwrap();
        let remaps = <GoogLeNet<TestBackend> as Architecture<_>>::key_remaps(spec);
        let rename = |key: &str| {
            remaps.iter().fold(key.to_string(), |k, (from, to)| {
                regex::Regex::new(from).unwrap().replace_all(&k, to.as_str()).to_string()
            })
        };
        assert_eq!(rename("inception3a.branch2.0.conv.weight"), "inception3a.branch2_reduce.conv.weight");
        assert_eq!(rename("inception3a.branch3.1.bn.running_mean"), "inception3a.branch3.bn.running_mean");
        assert_eq!(rename("inception4e.branch4.1.conv.weight"), "inception4e.branch4.conv.weight");
        assert_eq!(rename("conv1.bn.weight"), "conv1.bn.weight");
    }
}
