//! VGG 11/13/16/19, with and without batch norm

use burn::{
    module::{Module, ParamId},
    nn::{
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, Dropout, DropoutConfig, Linear,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{batch_norm, conv2d_bias, flatten, linear_head, linear_in_features, linear_param_ids};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::{FinetuneError, Result};

/// `None` marks a 2x2 max pool, `Some(c)` a 3x3 convolution to `c` channels
type Layout = &'static [Option<usize>];

const M: Option<usize> = None;

const VGG11: Layout = &[Some(64), M, Some(128), M, Some(256), Some(256), M, Some(512), Some(512), M, Some(512), Some(512), M];
const VGG13: Layout = &[
    Some(64), Some(64), M, Some(128), Some(128), M, Some(256), Some(256), M, Some(512), Some(512), M,
    Some(512), Some(512), M,
];
const VGG16: Layout = &[
    Some(64), Some(64), M, Some(128), Some(128), M, Some(256), Some(256), Some(256), M, Some(512),
    Some(512), Some(512), M, Some(512), Some(512), Some(512), M,
];
const VGG19: Layout = &[
    Some(64), Some(64), M, Some(128), Some(128), M, Some(256), Some(256), Some(256), Some(256), M,
    Some(512), Some(512), Some(512), Some(512), M, Some(512), Some(512), Some(512), Some(512), M,
];

fn layout(depth: usize) -> Result<Layout> {
    match depth {
        11 => Ok(VGG11),
        13 => Ok(VGG13),
        16 => Ok(VGG16),
        19 => Ok(VGG19),
        other => Err(FinetuneError::Model(format!("no VGG with depth {}", other))),
    }
}

/// Parse `vgg16_bn` into `(16, true)`
fn parse_name(name: &str) -> Result<(usize, bool)> {
    let rest = name
        .strip_prefix("vgg")
        .ok_or_else(|| FinetuneError::Model(format!("'{}' is not a VGG variant", name)))?;
    let (depth, batch_norm) = match rest.strip_suffix("_bn") {
        Some(depth) => (depth, true),
        None => (rest, false),
    };
    let depth = depth
        .parse()
        .map_err(|_| FinetuneError::Model(format!("'{}' is not a VGG variant", name)))?;
    Ok((depth, batch_norm))
}

#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: Option<BatchNorm<B>>,
}

impl<B: Backend> VggBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.bn {
            Some(bn) => bn.forward(x),
            None => x,
        };
        relu(x)
    }
}

#[derive(Module, Debug)]
pub struct Vgg<B: Backend> {
    pub blocks: Vec<VggBlock<B>>,
    pub pool: MaxPool2d,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    pub fc3: Linear<B>,
    pub dropout: Dropout,
    depth: usize,
}

impl<B: Backend> Vgg<B> {
    pub fn new(depth: usize, with_batch_norm: bool, num_classes: usize, device: &B::Device) -> Result<Self> {
        let mut in_channels = 3;
        let mut blocks = Vec::new();
        for out_channels in layout(depth)?.iter().flatten() {
            blocks.push(VggBlock {
                conv: conv2d_bias([in_channels, *out_channels], 3, 1, 1, device),
                bn: with_batch_norm.then(|| batch_norm(*out_channels, device)),
            });
            in_channels = *out_channels;
        }

        Ok(Self {
            blocks,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            avgpool: AdaptiveAvgPool2dConfig::new([7, 7]).init(),
            fc1: linear_head(512 * 7 * 7, 4096, device),
            fc2: linear_head(4096, 4096, device),
            fc3: linear_head(4096, num_classes, device),
            dropout: DropoutConfig::new(0.5).init(),
            depth,
        })
    }
}

impl<B: Backend> ImageClassifier<B> for Vgg<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        let mut blocks = self.blocks.iter();
        for entry in layout(self.depth).unwrap_or(VGG11) {
            x = match entry {
                Some(_) => match blocks.next() {
                    Some(block) => block.forward(x),
                    None => x,
                },
                None => self.pool.forward(x),
            };
        }

        let x = flatten(self.avgpool.forward(x));
        let x = self.dropout.forward(relu(self.fc1.forward(x)));
        let x = self.dropout.forward(relu(self.fc2.forward(x)));
        self.fc3.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.fc3.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        linear_param_ids(&self.fc3)
    }
}

impl<B: Backend> Architecture<B> for Vgg<B> {
    fn build(spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> Result<Self> {
        let (depth, batch_norm) = parse_name(spec.name)?;
        Self::new(depth, batch_norm, num_classes, device)
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc3 = linear_head(linear_in_features(&self.fc3), num_classes, device);
        self
    }

    /// torchvision numbers every conv, bn, relu and pool inside `features`
    fn key_remaps(spec: &ArchitectureSpec) -> Vec<(String, String)> {
        let Ok((depth, batch_norm)) = parse_name(spec.name) else {
            return Vec::new();
        };
        let Ok(layout) = layout(depth) else {
            return Vec::new();
        };

        let mut remaps = Vec::new();
        let mut index = 0;
        let mut block = 0;
        for entry in layout {
            if entry.is_some() {
                remaps.push((format!(r"^features\.{}\.", index), format!("blocks.{}.conv.", block)));
                if batch_norm {
                    remaps.push((format!(r"^features\.{}\.", index + 1), format!("blocks.{}.bn.", block)));
                    index += 1;
                }
                index += 2;
                block += 1;
            } else {
                index += 1;
            }
        }

        remaps.push((r"^classifier\.0\.".into(), "fc1.".into()));
        remaps.push((r"^classifier\.3\.".into(), "fc2.".into()));
        remaps.push((r"^classifier\.6\.".into(), "fc3.".into()));
        remaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::registry::lookup;

    #[test]
    fn test_parse_name() {
        assert_eq!(parse_name("vgg11").unwrap(), (11, false));
        assert_eq!(parse_name("vgg19_bn").unwrap(), (19, true));
        assert!(parse_name("vggx").is_err());
    }

    #[test]
    fn test_remaps_follow_torch_indices() {
        let remaps = <Vgg<burn_ndarray::NdArray<f32>> as Architecture<_>>::key_remaps(lookup("vgg11_bn").unwrap());
        // conv 0, bn 1, relu 2, pool 3, conv 4, bn 5
        assert!(remaps.contains(&(r"^features\.0\.".to_string(), "blocks.0.conv.".to_string())));
        assert!(remaps.contains(&(r"^features\.1\.".to_string(), "blocks.0.bn.".to_string())));
        assert!(remaps.contains(&(r"^features\.4\.".to_string(), "blocks.1.conv.".to_string())));
        assert!(remaps.contains(&(r"^features\.25\.".to_string(), "blocks.7.conv.".to_string())));

        let plain = <Vgg<burn_ndarray::NdArray<f32>> as Architecture<_>>::key_remaps(lookup("vgg16").unwrap());
        assert!(plain.contains(&(r"^features\.28\.".to_string(), "blocks.12.conv.".to_string())));
    }
}
