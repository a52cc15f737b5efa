use std::io::Write;
use std::process::Stdio;

use kube::CustomResourceExt;

use elbd_kubernetes::crd::eip::Eip;

// Make sure kind binary is in here
const KIND_BIN: &str = "../../bin/kind";
const KUBECTL_BIN: &str = "../../bin/kubectl";
const KIND_CLUSTER_NAME: &str = "elbd-integration";
pub(super) const KIND_NODE_CP: &str = "elbd-integration-control-plane";
const KIND_CLUSTER_IMAGE: &str = "kindest/node";
const KIND_CLUSTER_IMAGE_VERSION_ENV: &str = "KIND_NODE_VERSION";

pub fn setup_kind() {
    cleanup_kind_no_output();
    let mut binding = std::process::Command::new(KIND_BIN);
    binding.args(["create", "cluster", "--name", KIND_CLUSTER_NAME]);
    if let Ok(v) = std::env::var(KIND_CLUSTER_IMAGE_VERSION_ENV) {
        binding.args(["--image", &format!("{}:{}", KIND_CLUSTER_IMAGE, v)]);
    };

    let out = binding.output().expect("failed to create kind cluster");
    output_result(out);

    install_crd();

    std::thread::sleep(std::time::Duration::from_secs(2));
}

pub fn cleanup_kind() {
    let out = std::process::Command::new(KIND_BIN)
        .args(["delete", "cluster", "--name", KIND_CLUSTER_NAME])
        .output()
        .expect("failed to delete kind cluster");
    output_result(out);

    std::thread::sleep(std::time::Duration::from_secs(5));
}

pub fn cleanup_kind_no_output() {
    let _ = std::process::Command::new(KIND_BIN)
        .args(["delete", "cluster", "--name", KIND_CLUSTER_NAME])
        .output();
}

// Applies the generated CRD the same way `crdgen | kubectl apply -f -` does.
fn install_crd() {
    let manifest = serde_yaml::to_string(&Eip::crd()).expect("failed to render crd");
    let mut child = std::process::Command::new(KUBECTL_BIN)
        .args(["apply", "-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to run kubectl");
    child
        .stdin
        .take()
        .expect("stdin is piped")
        .write_all(manifest.as_bytes())
        .expect("failed to write crd");
    let out = child.wait_with_output().expect("failed to install crd");
    output_result(out);
}

fn output_result(out: std::process::Output) {
    if out.status.success() {
        println!("STDOUT");
        println!("{}", String::from_utf8_lossy(&out.stdout));
    } else {
        println!("STDERR: exit status is {}", out.status);
        println!("{}", String::from_utf8_lossy(&out.stderr));
    }
}
