//! Pipe and exec handlers
//!
//! Both run their `cmd` property through the subprocess stream. The pipe
//! handler feeds the image to the command's stdin; the exec handler passes
//! the image path as the last argument, resolving bare image names against
//! the agent's temporary directory where extracted images land.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use swu_common::{SwuError, SwuResult};
use tracing::{error, trace};

use crate::subprocess::{self, StreamOptions};

/// Handler properties attached to an image
pub type Properties = HashMap<String, String>;

fn command_property<'a>(properties: &'a Properties, handler: &str) -> SwuResult<&'a str> {
    match properties.get("cmd").map(|c| c.trim()) {
        Some(cmd) if !cmd.is_empty() => Ok(cmd),
        _ => {
            error!(
                "{} handler needs a command: please set the 'cmd' property",
                handler
            );
            Err(SwuError::InvalidInput(format!(
                "{} handler requires a 'cmd' property",
                handler
            )))
        }
    }
}

/// Stream `image` into the `cmd` property's stdin
pub fn pipe_image<R: Read>(
    properties: &Properties,
    image: &mut R,
    options: &StreamOptions,
) -> SwuResult<()> {
    let cmd = command_property(properties, "Pipe")?;

    let result = subprocess::run(cmd, image, options);
    if let Err(e) = &result {
        error!("Command failed: {}: {}", cmd, e);
    }
    trace!("finished piping image");
    result.map(|_| ())
}

/// Run `<cmd> <path>` with no input. A relative `image` is taken from `tmpdir`.
pub fn exec_image(
    properties: &Properties,
    image: &Path,
    tmpdir: &Path,
    options: &StreamOptions,
) -> SwuResult<()> {
    let cmd = command_property(properties, "Exec")?;
    let path = image_path(image, tmpdir);
    let command = format!("{} {}", cmd, path.display());

    trace!("Running {}", command);
    let result = subprocess::run(&command, &mut io::empty(), options);
    if result.is_err() {
        error!("Command failed: {}", command);
    }
    trace!("Finished running command");
    result.map(|_| ())
}

fn image_path(image: &Path, tmpdir: &Path) -> PathBuf {
    if image.is_absolute() {
        image.to_path_buf()
    } else {
        tmpdir.join(image)
    }
}
