use state_machines::state_machine;

state_machine! {
    name: DocumentMachine,
    state: DocumentState,
    initial: Ready,
    states: [Ready, Downloaded, Extracted, Analyzed, Persisted, Failed],
    events {
        download { transition: { from: Ready, to: Downloaded } }
        extract { transition: { from: Downloaded, to: Extracted } }
        analyze { transition: { from: Extracted, to: Analyzed } }
        persist { transition: { from: Analyzed, to: Persisted } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Downloaded, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Analyzed, to: Failed }
        }
    }
}

pub fn ready() -> DocumentMachine<(), Ready> {
    DocumentMachine::new(())
}
