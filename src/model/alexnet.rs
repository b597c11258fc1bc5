//! AlexNet (torchvision's single-tower variant)

use burn::{
    module::{Module, ParamId},
    nn::{
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::layers::{conv2d_bias, flatten, linear_head, linear_in_features, linear_param_ids};
use super::registry::ArchitectureSpec;
use super::{Architecture, ImageClassifier};
use crate::utils::Result;

#[derive(Module, Debug)]
pub struct AlexNet<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
    pub conv3: Conv2d<B>,
    pub conv4: Conv2d<B>,
    pub conv5: Conv2d<B>,
    pub pool: MaxPool2d,
    pub avgpool: AdaptiveAvgPool2d,
    pub dropout: Dropout,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    pub fc3: Linear<B>,
}

impl<B: Backend> AlexNet<B> {
    pub fn new(num_classes: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv2d_bias([3, 64], 11, 4, 2, device),
            conv2: conv2d_bias([64, 192], 5, 1, 2, device),
            conv3: conv2d_bias([192, 384], 3, 1, 1, device),
            conv4: conv2d_bias([384, 256], 3, 1, 1, device),
            conv5: conv2d_bias([256, 256], 3, 1, 1, device),
            pool: MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init(),
            avgpool: AdaptiveAvgPool2dConfig::new([6, 6]).init(),
            dropout: DropoutConfig::new(0.5).init(),
            fc1: linear_head(256 * 6 * 6, 4096, device),
            fc2: linear_head(4096, 4096, device),
            fc3: linear_head(4096, num_classes, device),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for AlexNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(relu(self.conv1.forward(images)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));
        let x = relu(self.conv3.forward(x));
        let x = relu(self.conv4.forward(x));
        let x = self.pool.forward(relu(self.conv5.forward(x)));

        let x = flatten(self.avgpool.forward(x));
        let x = relu(self.fc1.forward(self.dropout.forward(x)));
        let x = relu(self.fc2.forward(self.dropout.forward(x)));
        self.fc3.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.fc3.weight.val().dims()[1]
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        linear_param_ids(&self.fc3)
    }
}

impl<B: Backend> Architecture<B> for AlexNet<B> {
    fn build(_spec: &ArchitectureSpec, num_classes: usize, _pretrained: bool, device: &B::Device) -> Result<Self> {
        Ok(Self::new(num_classes, device))
    }

    fn replace_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc3 = linear_head(linear_in_features(&self.fc3), num_classes, device);
        self
    }

    fn key_remaps(_spec: &ArchitectureSpec) -> Vec<(String, String)> {
        [
            (r"^features\.0\.", "conv1."),
            (r"^features\.3\.", "conv2."),
            (r"^features\.6\.", "conv3."),
            (r"^features\.8\.", "conv4."),
            (r"^features\.10\.", "conv5."),
            (r"^classifier\.1\.", "fc1."),
            (r"^classifier\.4\.", "fc2."),
            (r"^classifier\.6\.", "fc3."),
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

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = AlexNet::<NdArray<f32>>::new(4, &device);
        let x = Tensor::<NdArray<f32>, 4>::zeros([1, 3, 96, 96], &device);
        assert_eq!(model.forward(x).dims(), [1, 4]);
    }
}
