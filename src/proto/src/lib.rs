// Generated from proto/speaker.proto with tonic-build 0.10.
pub mod elbd {
    pub mod v1 {
        include!("elbd.v1.rs");
    }
}
