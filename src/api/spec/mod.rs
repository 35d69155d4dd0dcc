pub mod window_spec;
