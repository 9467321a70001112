//! Fixed, pretrained networks: layer evaluation and artifact loading.

pub mod artifact;
pub mod layers;
