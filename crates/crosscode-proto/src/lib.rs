pub mod crosscode {
    pub mod v1 {
        tonic::include_proto!("crosscode.v1");
    }
}
