pub mod bencode;
pub mod control;
