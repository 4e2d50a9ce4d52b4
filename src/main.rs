use mimalloc::MiMalloc;
use xlsx_session::XlsxSession;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const FILE: &str = "TestData.xlsx";
const SHEET: &str = "Sheet1";

fn run() -> anyhow::Result<()> {
    let mut app = XlsxSession::open(FILE, SHEET)?;

    let data1 = ["Test User", "testuser@example.com", "Hello"];
    let data2 = ["New User", "newuser@example.com"];
    app.set_cell_value_in_next_row(data1)?;
    app.set_cell_value_in_next_row(data2)?;

    app.save_and_close()?;
    println!("Data entered successfully");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:?}");
    }
}
