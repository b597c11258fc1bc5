//! ResNet, ResNeXt and Wide ResNet
//!
//! Parameter names follow torchvision (`layer1.0.conv1.weight`), except for
//! the shortcut projection which is a named struct instead of a sequential.

use burn::{
    config::Config,
    module::{Module, ParamId},
    nn::{
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, Linear, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{batch_norm, conv2d, conv2d_grouped, flatten, linear_head, linear_in_features, linear_param_ids};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::FinetuneError;

/// Configuration for a ResNet-style network
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Blocks per stage
    pub layers: [usize; 4],

    /// Bottleneck (1x1, 3x3, 1x1) blocks instead of basic (3x3, 3x3) blocks
    #[config(default = "false")]
    pub bottleneck: bool,

    /// Grouped convolutions in the bottleneck 3x3 (ResNeXt)
    #[config(default = "1")]
    pub groups: usize,

    /// Bottleneck width per group; 128 gives Wide ResNet
    #[config(default = "64")]
    pub width_per_group: usize,
}

impl ResNetConfig {
    /// Configuration of a named torchvision variant
    pub fn named(name: &str, num_classes: usize) -> crate::utils::Result<Self> {
        let config = match name {
            "resnet18" => Self::new(num_classes, [2, 2, 2, 2]),
            "resnet34" => Self::new(num_classes, [3, 4, 6, 3]),
            "resnet50" => Self::new(num_classes, [3, 4, 6, 3]).with_bottleneck(true),
            "resnet101" => Self::new(num_classes, [3, 4, 23, 3]).with_bottleneck(true),
            "resnet152" => Self::new(num_classes, [3, 8, 36, 3]).with_bottleneck(true),
            "resnext50_32x4d" => Self::new(num_classes, [3, 4, 6, 3])
                .with_bottleneck(true)
                .with_groups(32)
                .with_width_per_group(4),
            "resnext101_32x8d" => Self::new(num_classes, [3, 4, 23, 3])
                .with_bottleneck(true)
                .with_groups(32)
                .with_width_per_group(8),
            "wide_resnet50_2" => Self::new(num_classes, [3, 4, 6, 3])
                .with_bottleneck(true)
                .with_width_per_group(128),
            "wide_resnet101_2" => Self::new(num_classes, [3, 4, 23, 3])
                .with_bottleneck(true)
                .with_width_per_group(128),
            other => {
                return Err(FinetuneError::Model(format!(
                    "'{}' is not a ResNet variant",
                    other
                )))
            }
        };
        Ok(config)
    }

    fn expansion(&self) -> usize {
        if self.bottleneck {
            4
        } else {
            1
        }
    }
}

/// 1x1 projection on the shortcut path
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

/// Basic block when `conv3` is absent, bottleneck block otherwise
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub conv3: Option<Conv2d<B>>,
    pub bn3: Option<BatchNorm<B>>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(
        config: &ResNetConfig,
        in_channels: usize,
        planes: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let out_channels = planes * config.expansion();
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: conv2d([in_channels, out_channels], 1, stride, 0, device),
            bn: batch_norm(out_channels, device),
        });

        if config.bottleneck {
            let width = planes * config.width_per_group / 64 * config.groups;
            Self {
                conv1: conv2d([in_channels, width], 1, 1, 0, device),
                bn1: batch_norm(width, device),
                conv2: conv2d_grouped([width, width], 3, stride, 1, config.groups, device),
                bn2: batch_norm(width, device),
                conv3: Some(conv2d([width, out_channels], 1, 1, 0, device)),
                bn3: Some(batch_norm(out_channels, device)),
                downsample,
            }
        } else {
            Self {
                conv1: conv2d([in_channels, planes], 3, stride, 1, device),
                bn1: batch_norm(planes, device),
                conv2: conv2d([planes, planes], 3, 1, 1, device),
                bn2: batch_norm(planes, device),
                conv3: None,
                bn3: None,
                downsample,
            }
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.bn.forward(down.conv.forward(x.clone())),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        let out = match (&self.conv3, &self.bn3) {
            (Some(conv3), Some(bn3)) => bn3.forward(conv3.forward(relu(out))),
            _ => out,
        };

        relu(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub maxpool: MaxPool2d,
    pub layer1: Vec<ResidualBlock<B>>,
    pub layer2: Vec<ResidualBlock<B>>,
    pub layer3: Vec<ResidualBlock<B>>,
    pub layer4: Vec<ResidualBlock<B>>,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    pub fn new(config: &ResNetConfig, device: &B::Device) -> Self {
        let mut in_channels = 64;
        let mut stage = |planes: usize, blocks: usize, stride: usize| {
            let layer: Vec<ResidualBlock<B>> = (0..blocks)
                .map(|i| {
                    let block = ResidualBlock::new(
                        config,
                        in_channels,
                        planes,
                        if i == 0 { stride } else { 1 },
                        device,
                    );
                    in_channels = planes * config.expansion();
                    block
                })
                .collect();
            layer
        };

        let layer1 = stage(64, config.layers[0], 1);
        let layer2 = stage(128, config.layers[1], 2);
        let layer3 = stage(256, config.layers[2], 2);
        let layer4 = stage(512, config.layers[3], 2);

        Self {
            conv1: conv2d([3, 64], 7, 2, 3, device),
            bn1: batch_norm(64, device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: linear_head(512 * config.expansion(), config.num_classes, device),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for ResNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let x = self.maxpool.forward(x);

        let x = self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
            .fold(x, |x, block| block.forward(x));

        self.fc.forward(flatten(self.avgpool.forward(x)))
    }

    fn num_classes(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        linear_param_ids(&self.fc)
    }
}

impl<B: Backend> Architecture<B> for ResNet<B> {
    fn build(spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> crate::utils::Result<Self> {
        Ok(Self::new(&ResNetConfig::named(spec.name, num_classes)?, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc = linear_head(linear_in_features(&self.fc), num_classes, device);
        self
    }

    fn key_remaps(_spec: &ArchitectureSpec) -> Vec<(String, String)> {
        vec![
            (r"\.downsample\.0\.".into(), ".downsample.conv.".into()),
            (r"\.downsample\.1\.".into(), ".downsample.bn.".into()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_resnet18_forward() {
        let device = Default::default();
        let config = ResNetConfig::named("resnet18", 3).unwrap();
        let model = ResNet::<TestBackend>::new(&config, &device);

        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        assert_eq!(model.forward(x).dims(), [2, 3]);
        assert_eq!(model.layer1.len(), 2);
        assert!(model.layer1[0].downsample.is_none());
        assert!(model.layer2[0].downsample.is_some());
    }

    #[test]
    fn test_bottleneck_widths() {
        let device = Default::default();
        let config = ResNetConfig::named("resnext50_32x4d", 10).unwrap();
        let model = ResNet::<TestBackend>::new(&config, &device);

        // planes 64, 4 channels per group, 32 groups
        assert_eq!(model.layer1[0].conv1.weight.val().dims(), [128, 64, 1, 1]);
        assert_eq!(model.layer1[0].conv2.weight.val().dims(), [128, 4, 3, 3]);
        assert_eq!(linear_in_features(&model.fc), 2048);
    }

    #[test]
    fn test_unknown_variant() {
        assert!(ResNetConfig::named("resnet9", 2).is_err());
    }
}
