pub fn print_startup_banner() {
    let year = chrono::Local::now().format("%Y").to_string();

    // ANSI color codes
    let amber = "\x1B[38;5;214m";
    let gray = "\x1B[38;5;245m";
    let bright_amber = "\x1B[93m";
    let reset = "\x1B[0m";

    println!(
        r#"
  {year} Hearth
   {amber}
            (
             )  )
         (  (  (          {gray}Keep the fire lit{amber}
          ) _)_ )
       .-'(_____)'-.      {gray}and the table set{amber}
      /_____________\
      |  __     __  |
      | |  |   |  | |
      | |__|   |__| |
      |      _      |
      |     | |     |
  ~~~~'-----'-'-----'~~~~
         {bright_amber}hearth v{version}{reset}
"#,
        year = year,
        amber = amber,
        gray = gray,
        bright_amber = bright_amber,
        version = env!("CARGO_PKG_VERSION"),
        reset = reset
    );
}
