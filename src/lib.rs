pub mod events;
pub mod power;
pub mod scan;
pub mod platform {
    pub mod drm_power;
    pub mod lid_switch;
}
pub mod xorg {
    pub mod dpms;
    pub mod helper;
    pub mod procfs;
}
