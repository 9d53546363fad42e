//! HTML to JSX conversion: `launchpad jsx`.

use std::path::Path;

use anyhow::Result;

pub fn cmd_jsx(
    input: &Path,
    output: Option<&Path>,
    component: Option<&str>,
    add_imports: bool,
) -> Result<()> {
    let conversion = launchpad::jsx::convert_file(input, output, component, add_imports)?;
    println!(
        "Converted {} -> {} (component {})",
        input.display(),
        conversion.output.display(),
        conversion.component_name
    );
    Ok(())
}
