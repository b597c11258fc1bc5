//! Pretrained CNN architectures built with Burn
//!
//! - `registry`: static table of the supported architectures
//! - `factory`: construction, head replacement, freezing and reloading
//! - `pretrained`: torchvision checkpoint cache and import
//! - one module per architecture family
//!
//! Every family implements [`ImageClassifier`] (what the training loop needs)
//! and [`Architecture`] (what the factory needs). Parameter names follow
//! torchvision where the structure allows it, so that ImageNet checkpoints
//! import with a small set of key remaps.

pub mod alexnet;
pub mod densenet;
pub mod factory;
pub mod googlenet;
pub mod inception;
pub mod layers;
pub mod mnasnet;
pub mod mobilenet;
pub mod pretrained;
pub mod registry;
pub mod resnet;
pub mod shufflenet;
pub mod squeezenet;
pub mod vgg;

use burn::{
    module::{Module, ParamId},
    tensor::{backend::Backend, Tensor},
};

pub use factory::{create_model, get_model, load_model, ModelOptions};
pub use registry::{ArchitectureSpec, Family, ARCHITECTURES};

use crate::utils::Result;

/// Logits of one forward pass in training mode
#[derive(Debug, Clone)]
pub struct ClassifierOutput<B: Backend> {
    pub logits: Tensor<B, 2>,
    /// Only inception_v3 produces auxiliary logits
    pub aux_logits: Option<Tensor<B, 2>>,
}

/// A classifier over `[N, 3, H, W]` images
pub trait ImageClassifier<B: Backend>: Module<B> {
    /// Logits `[N, num_classes]` of the primary head
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Forward pass used while training, including auxiliary heads
    fn forward_train(&self, images: Tensor<B, 4>) -> ClassifierOutput<B> {
        ClassifierOutput {
            logits: self.forward(images),
            aux_logits: None,
        }
    }

    /// Width of the primary classification head
    fn num_classes(&self) -> usize;

    /// Parameters of the classification head(s)
    fn head_param_ids(&self) -> Vec<ParamId>;
}

/// Construction hooks used by the factory
pub trait Architecture<B: Backend>: ImageClassifier<B> + Sized {
    /// Build a randomly initialised network with a `num_classes` head.
    ///
    /// `pretrained` only toggles input-transform flags that the ImageNet
    /// weights expect; weights are loaded separately.
    fn build(
        spec: &ArchitectureSpec,
        num_classes: usize,
        pretrained: bool,
        device: &B::Device,
    ) -> Result<Self>;

    /// Swap the classification head(s) for fresh layers with `num_classes` outputs
    fn replace_head(self, num_classes: usize, device: &B::Device) -> Self;

    /// Regex renames from torchvision state-dict keys to this module's keys
    fn key_remaps(spec: &ArchitectureSpec) -> Vec<(String, String)>;
}

/// Call a function generic over `<Backend, Architecture>` with the concrete
/// module type of a [`Family`].
macro_rules! with_architecture {
    ($family:expr, $backend:ty, $func:ident($($arg:expr),* $(,)?)) => {
        match $family {
            $crate::model::Family::ResNet => {
                $func::<$backend, $crate::model::resnet::ResNet<$backend>>($($arg),*)
            }
            $crate::model::Family::AlexNet => {
                $func::<$backend, $crate::model::alexnet::AlexNet<$backend>>($($arg),*)
            }
            $crate::model::Family::Vgg => {
                $func::<$backend, $crate::model::vgg::Vgg<$backend>>($($arg),*)
            }
            $crate::model::Family::SqueezeNet => {
                $func::<$backend, $crate::model::squeezenet::SqueezeNet<$backend>>($($arg),*)
            }
            $crate::model::Family::DenseNet => {
                $func::<$backend, $crate::model::densenet::DenseNet<$backend>>($($arg),*)
            }
            $crate::model::Family::GoogLeNet => {
                $func::<$backend, $crate::model::googlenet::GoogLeNet<$backend>>($($arg),*)
            }
            $crate::model::Family::ShuffleNetV2 => {
                $func::<$backend, $crate::model::shufflenet::ShuffleNetV2<$backend>>($($arg),*)
            }
            $crate::model::Family::MobileNetV2 => {
                $func::<$backend, $crate::model::mobilenet::MobileNetV2<$backend>>($($arg),*)
            }
            $crate::model::Family::MnasNet => {
                $func::<$backend, $crate::model::mnasnet::MnasNet<$backend>>($($arg),*)
            }
            $crate::model::Family::InceptionV3 => {
                $func::<$backend, $crate::model::inception::InceptionV3<$backend>>($($arg),*)
            }
        }
    };
}

pub(crate) use with_architecture;
