use elbd_kubernetes::crd;
use kube::{core::crd::merge_crds, CustomResourceExt};

// v1alpha1 is kept as a served version so existing EIP objects stay readable.
fn main() -> anyhow::Result<()> {
    let eip = merge_crds(
        vec![crd::eip_v1alpha1::Eip::crd(), crd::eip::Eip::crd()],
        "v1alpha2",
    )?;
    print!("{}", serde_yaml::to_string(&eip)?);
    Ok(())
}
