pub mod checksum;
pub mod ip;
pub mod packet;
pub mod tcp;
