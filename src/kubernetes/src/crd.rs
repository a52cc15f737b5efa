pub mod eip;
pub mod eip_v1alpha1;
