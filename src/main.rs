use anyhow::Error;

use crate::program::Program;

mod generator;
mod program;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let program = Program::from_args(std::env::args().skip(1).collect())?;
    program.run().await
}
