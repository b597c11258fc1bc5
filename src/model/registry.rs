//! Static registry of the supported architectures

use std::fmt;

use serde::Serialize;
use tracing::warn;

/// Base URL of torchvision's published ImageNet checkpoints
pub const WEIGHTS_BASE_URL: &str = "https://download.pytorch.org/models/";

/// Architecture used when the requested name is not registered
pub const FALLBACK_ARCHITECTURE: &str = "inception_v3";

/// Module type shared by the variants of one network family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Family {
    ResNet,
    AlexNet,
    Vgg,
    SqueezeNet,
    DenseNet,
    GoogLeNet,
    ShuffleNetV2,
    MobileNetV2,
    MnasNet,
    InceptionV3,
}

/// One registered architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchitectureSpec {
    pub name: &'static str,
    pub family: Family,
    /// Square input resolution the network is trained at
    pub input_size: u32,
    /// Field path of the classification layer that gets replaced
    pub head: &'static str,
    /// Whether a second (auxiliary) head is resized and trained as well
    pub has_aux_head: bool,
    /// torchvision checkpoint file name under [`WEIGHTS_BASE_URL`]
    pub weights_file: &'static str,
}

impl ArchitectureSpec {
    pub fn weights_url(&self) -> String {
        format!("{}{}", WEIGHTS_BASE_URL, self.weights_file)
    }
}

impl fmt::Display for ArchitectureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {}px)", self.name, self.family, self.input_size)
    }
}

const fn arch(name: &'static str, family: Family, head: &'static str, weights_file: &'static str) -> ArchitectureSpec {
    ArchitectureSpec {
        name,
        family,
        input_size: 224,
        head,
        has_aux_head: false,
        weights_file,
    }
}

pub static ARCHITECTURES: [ArchitectureSpec; 31] = [
    arch("resnet18", Family::ResNet, "fc", "resnet18-f37072fd.pth"),
    arch("resnet34", Family::ResNet, "fc", "resnet34-b627a593.pth"),
    arch("resnet50", Family::ResNet, "fc", "resnet50-0676ba61.pth"),
    arch("resnet101", Family::ResNet, "fc", "resnet101-63fe2227.pth"),
    arch("resnet152", Family::ResNet, "fc", "resnet152-394f9c45.pth"),
    arch("alexnet", Family::AlexNet, "fc3", "alexnet-owt-7be5be79.pth"),
    arch("vgg11", Family::Vgg, "fc3", "vgg11-8a719046.pth"),
    arch("vgg11_bn", Family::Vgg, "fc3", "vgg11_bn-6002323d.pth"),
    arch("vgg13", Family::Vgg, "fc3", "vgg13-19584684.pth"),
    arch("vgg13_bn", Family::Vgg, "fc3", "vgg13_bn-abd245e5.pth"),
    arch("vgg16", Family::Vgg, "fc3", "vgg16-397923af.pth"),
    arch("vgg16_bn", Family::Vgg, "fc3", "vgg16_bn-6c64b313.pth"),
    arch("vgg19", Family::Vgg, "fc3", "vgg19-dcbb9e9d.pth"),
    arch("vgg19_bn", Family::Vgg, "fc3", "vgg19_bn-c79401a0.pth"),
    arch("squeezenet1_0", Family::SqueezeNet, "classifier", "squeezenet1_0-b66bff10.pth"),
    arch("squeezenet1_1", Family::SqueezeNet, "classifier", "squeezenet1_1-b8a52dc0.pth"),
    arch("densenet121", Family::DenseNet, "classifier", "densenet121-a639ec97.pth"),
    arch("densenet161", Family::DenseNet, "classifier", "densenet161-8d451a50.pth"),
    arch("densenet169", Family::DenseNet, "classifier", "densenet169-b2777c0a.pth"),
    arch("densenet201", Family::DenseNet, "classifier", "densenet201-c1103571.pth"),
    arch("googlenet", Family::GoogLeNet, "fc", "googlenet-1378be20.pth"),
    arch("shufflenet_v2_x0_5", Family::ShuffleNetV2, "fc", "shufflenetv2_x0.5-f707e7126e.pth"),
    arch("shufflenet_v2_x1_0", Family::ShuffleNetV2, "fc", "shufflenetv2_x1-5666bf0f80.pth"),
    arch("mobilenet_v2", Family::MobileNetV2, "classifier", "mobilenet_v2-b0353104.pth"),
    arch("resnext50_32x4d", Family::ResNet, "fc", "resnext50_32x4d-7cdf4587.pth"),
    arch("resnext101_32x8d", Family::ResNet, "fc", "resnext101_32x8d-8ba56ff5.pth"),
    arch("wide_resnet50_2", Family::ResNet, "fc", "wide_resnet50_2-95faca4d.pth"),
    arch("wide_resnet101_2", Family::ResNet, "fc", "wide_resnet101_2-32ee1156.pth"),
    arch("mnasnet0_5", Family::MnasNet, "classifier", "mnasnet0.5_top1_67.823-3ffadce67e.pth"),
    arch("mnasnet1_0", Family::MnasNet, "classifier", "mnasnet1.0_top1_73.512-f206786ef8.pth"),
    ArchitectureSpec {
        name: "inception_v3",
        family: Family::InceptionV3,
        input_size: 299,
        head: "fc",
        has_aux_head: true,
        weights_file: "inception_v3_google-0cc3c7bd.pth",
    },
];

/// Exact lookup by name
pub fn lookup(name: &str) -> Option<&'static ArchitectureSpec> {
    ARCHITECTURES.iter().find(|spec| spec.name == name)
}

/// Lookup with fallback to [`FALLBACK_ARCHITECTURE`]
pub fn resolve(name: &str) -> &'static ArchitectureSpec {
    if let Some(spec) = lookup(name) {
        return spec;
    }
    warn!(
        "Unknown architecture '{}', falling back to {}",
        name, FALLBACK_ARCHITECTURE
    );
    &ARCHITECTURES[ARCHITECTURES.len() - 1]
}

/// Names of all registered architectures, in registry order
pub fn names() -> Vec<&'static str> {
    ARCHITECTURES.iter().map(|spec| spec.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{with_architecture, Architecture};
    use burn::tensor::backend::Backend;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn head_width<B: Backend, M: Architecture<B>>(spec: &ArchitectureSpec, num_classes: usize, device: &B::Device) -> usize {
        M::build(spec, 1000, false, device)
            .unwrap()
            .replace_head(num_classes, device)
            .num_classes()
    }

    #[test]
    fn test_names_are_unique() {
        let mut names = names();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ARCHITECTURES.len());
    }

    #[test]
    fn test_fallback_is_inception() {
        assert_eq!(resolve("inception_v3").name, "inception_v3");
        assert_eq!(resolve("resnet9000").name, FALLBACK_ARCHITECTURE);
        assert_eq!(resolve("resnet9000").input_size, 299);
        assert_eq!(resolve("alexnet").input_size, 224);
    }

    #[test]
    fn test_only_inception_has_aux_head() {
        let with_aux: Vec<_> = ARCHITECTURES.iter().filter(|s| s.has_aux_head).map(|s| s.name).collect();
        assert_eq!(with_aux, vec!["inception_v3"]);
    }

    #[test]
    fn test_weights_url() {
        let url = lookup("resnet18").unwrap().weights_url();
        assert_eq!(url, "https://download.pytorch.org/models/resnet18-f37072fd.pth");
    }

    #[test]
    fn test_every_architecture_gets_requested_head_width() {
        let device = Default::default();
        for spec in ARCHITECTURES.iter() {
            let width = with_architecture!(spec.family, TestBackend, head_width(spec, 5, &device));
            assert_eq!(width, 5, "{}", spec.name);
        }
    }
}
