pub mod encoding;
pub mod frame;
pub mod gid;
pub mod pacer;
pub mod reassembly;
pub mod ring;
pub mod split;
