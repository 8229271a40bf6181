pub mod teensyboot;
