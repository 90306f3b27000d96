pub mod contribution_reader;
pub mod cycle_writer;
