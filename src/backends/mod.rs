pub mod proxmox;
pub mod ssh;
pub mod wol;
